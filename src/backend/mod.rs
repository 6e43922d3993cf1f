//! Storage drivers behind the collection facade.
//!
//! A driver is chosen once when the store opens; everything above it talks to `dyn Driver`.

mod document;
pub mod snapshot;
mod table;

pub use document::DocumentDriver;
pub use table::{DEFAULT_SCAN_PAGE_SIZE, KEY_ATTRIBUTE, PutCondition, ScanPage, TableDriver, TableItem, TableStore};

use bson::Document as BsonDocument;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::DbError;
use crate::query::{ArrayFilter, Filter, UpdateDoc, UpdateReport, apply_update};

/// Fields that name a document in the audit trail.
pub const IDENTITY_FIELDS: [&str; 2] = ["order_id", "id"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Document,
    Table,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Document => "document",
            Self::Table => "table",
        })
    }
}

/// One contract over every backing technology.
///
/// Drivers return raw `DbError`s; the collection facade decides which of them are surfaced and which
/// are downgraded to empty results.
pub trait Driver: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// # Errors
    /// Backend failures and malformed filters.
    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<BsonDocument>, DbError>;

    /// Every document matching `filter`, in backend order, projected when `projection` is given.
    ///
    /// # Errors
    /// Backend failures and malformed filters.
    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[String]>,
    ) -> Result<Vec<BsonDocument>, DbError>;

    /// Update the first matching document, or insert one when `upsert` is set and nothing matches.
    ///
    /// The update has already been validated against `array_filters`.
    ///
    /// # Errors
    /// Backend failures, unique-index violations and update application errors.
    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        upsert: bool,
        array_filters: &[ArrayFilter],
    ) -> Result<UpdateReport, DbError>;

    /// # Errors
    /// Backend failures; drivers without secondary indexes accept and ignore the request.
    fn create_index(&self, collection: &str, field: &str, unique: bool) -> Result<(), DbError>;
}

/// Build the document an upsert inserts: the filter's top-level equalities first, then the update
/// applied in insert mode (`$setOnInsert`, `$set`, `$pull`, `$push`).
///
/// # Errors
/// Propagates update application errors.
pub fn synthesize_upsert(
    filter: &Filter,
    update: &UpdateDoc,
    array_filters: &[ArrayFilter],
) -> Result<BsonDocument, DbError> {
    let mut doc = BsonDocument::new();
    for (field, value) in filter.seed_fields() {
        doc.insert(field, value.clone());
    }
    apply_update(&mut doc, update, array_filters, true)?;
    Ok(doc)
}
