use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::backend::{BackendKind, DEFAULT_SCAN_PAGE_SIZE};
use crate::errors::DbError;

pub const DEFAULT_CONFIG_FILE: &str = "fablink.toml";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Base directory for log files; `None` keeps logging unconfigured.
    pub dir: Option<PathBuf>,
    pub level: String,
    pub retention: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { dir: None, level: "info".into(), retention: 7 }
    }
}

/// Store configuration.
///
/// Precedence: defaults, then the TOML file, then `FABLINK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Deployment environment: `local`, `dev` or `prod`.
    pub environment: String,
    /// Explicit backend; derived from `environment` when unset.
    pub backend: Option<BackendKind>,
    /// Directory for persisted collections; purely in-memory when unset.
    pub data_dir: Option<PathBuf>,
    /// Prepended to collection names on the table backend.
    pub table_prefix: String,
    pub scan_page_size: usize,
    pub orders_collection: String,
    pub log: LogConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            environment: "local".into(),
            backend: None,
            data_dir: None,
            table_prefix: String::new(),
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
            orders_collection: "orders".into(),
            log: LogConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Load from `path`, else `FABLINK_CONFIG`, else `./fablink.toml` when present; then apply
    /// environment overrides.
    ///
    /// # Errors
    /// Returns an error when an explicitly named file is missing, or any file fails to parse.
    pub fn load(path: Option<&Path>) -> Result<Self, DbError> {
        let explicit = path.map(Path::to_path_buf).or_else(|| std::env::var("FABLINK_CONFIG").ok().map(PathBuf::from));
        let mut cfg = match explicit {
            Some(p) => Self::from_file(&p)?,
            None => {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                if local.exists() { Self::from_file(&local)? } else { Self::default() }
            }
        };
        cfg.apply_env(|k| std::env::var(k).ok())?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns an error if the file cannot be read or is not valid TOML for this shape.
    pub fn from_file(path: &Path) -> Result<Self, DbError> {
        let s = std::fs::read_to_string(path)
            .map_err(|e| DbError::Io(format!("reading config {}: {e}", path.display())))?;
        let cfg: Self = toml::from_str(&s)?;
        log::debug!("config loaded from {}", path.display());
        Ok(cfg)
    }

    /// Apply `FABLINK_ENV`, `FABLINK_BACKEND`, `FABLINK_DATA_DIR` and `FABLINK_TABLE_PREFIX`.
    ///
    /// # Errors
    /// Returns `DbError::Config` for an unknown backend name.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), DbError> {
        if let Some(env) = var("FABLINK_ENV") {
            self.environment = env;
        }
        if let Some(b) = var("FABLINK_BACKEND") {
            self.backend = Some(match b.to_ascii_lowercase().as_str() {
                "document" => BackendKind::Document,
                "table" => BackendKind::Table,
                other => return Err(DbError::Config(format!("unknown backend '{other}'"))),
            });
        }
        if let Some(dir) = var("FABLINK_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(prefix) = var("FABLINK_TABLE_PREFIX") {
            self.table_prefix = prefix;
        }
        Ok(())
    }

    /// The backend to open: the explicit choice, else `local` → document store and every other
    /// environment → table store.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.backend.unwrap_or_else(|| {
            if self.environment.eq_ignore_ascii_case("local") { BackendKind::Document } else { BackendKind::Table }
        })
    }
}
