use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Serde JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Collection not found: {0}")]
    NoSuchCollection(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Malformed operation: {0}")]
    MalformedOperation(String),

    #[error("Duplicate key on unique index '{index}': {key}")]
    DuplicateKey { index: String, key: String },

    #[error("Conditional check failed for key: {0}")]
    ConditionalCheckFailed(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

impl From<std::io::Error> for DbError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<toml::de::Error> for DbError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl DbError {
    /// Requests refused before any mutation; everything else is a failure of the backing store.
    #[must_use]
    pub const fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueryError(_) | Self::MalformedOperation(_) | Self::DuplicateKey { .. } | Self::NoSuchCollection(_)
        )
    }
}
