use bson::{Bson, Document as BsonDocument};
use std::sync::Arc;

use crate::backend::{Driver, IDENTITY_FIELDS};
use crate::errors::DbError;
use crate::logger::AUDIT_TARGET;
use crate::query::{
    ArrayFilter, Cursor, Filter, FindOptions, UpdateDoc, UpdateReport, parse_array_filters, parse_filter,
    parse_update, validate_update,
};

/// A named collection on the configured driver.
///
/// This is the error boundary: failures of the backing store are logged and come back as empty
/// reads, zero counts or a failed `UpdateReport`. Requests that are wrong in themselves (malformed
/// updates, unsupported operators, unique-key violations) are returned as `Err` without mutation.
#[derive(Clone)]
pub struct Collection {
    name: String,
    driver: Arc<dyn Driver>,
}

impl Collection {
    #[must_use]
    pub fn new(name: impl Into<String>, driver: Arc<dyn Driver>) -> Self {
        Self { name: name.into(), driver }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// First matching document; `None` when nothing matches or the store is unreachable.
    #[must_use]
    pub fn find_one(&self, filter: &Filter) -> Option<BsonDocument> {
        match self.driver.find_one(&self.name, filter) {
            Ok(doc) => doc,
            Err(e) => {
                log::error!("find_one on '{}' failed: {e}", self.name);
                None
            }
        }
    }

    /// Matching documents as a cursor; empty when the store is unreachable.
    #[must_use]
    pub fn find(&self, filter: &Filter, opts: &FindOptions) -> Cursor {
        match self.driver.find(&self.name, filter, opts.projection.as_deref()) {
            Ok(docs) => Cursor::new(docs),
            Err(e) => {
                log::error!("find on '{}' failed: {e}", self.name);
                Cursor::new(Vec::new())
            }
        }
    }

    #[must_use]
    pub fn count_documents(&self, filter: &Filter) -> u64 {
        match self.driver.find(&self.name, filter, None) {
            Ok(docs) => docs.len() as u64,
            Err(e) => {
                log::error!("count_documents on '{}' failed: {e}", self.name);
                0
            }
        }
    }

    /// Update one document (or insert it, with `upsert`).
    ///
    /// # Errors
    /// Returns `MalformedOperation` for invalid updates (checked before anything is read) and
    /// `DuplicateKey` when the write would break a unique index. Store failures are reported through
    /// `UpdateReport::failed` instead.
    pub fn update_one(
        &self,
        filter: &Filter,
        update: &UpdateDoc,
        upsert: bool,
        array_filters: &[ArrayFilter],
    ) -> Result<UpdateReport, DbError> {
        validate_update(update, array_filters)?;
        match self.driver.update_one(&self.name, filter, update, upsert, array_filters) {
            Ok(report) => {
                if report.modified > 0 {
                    log::info!(
                        target: AUDIT_TARGET,
                        "op=update_one collection={} key={} upserted={}",
                        self.name,
                        audit_key(filter),
                        report.upserted
                    );
                }
                Ok(report)
            }
            Err(e) if e.is_rejection() => {
                log::warn!("update_one on '{}' rejected: {e}", self.name);
                Err(e)
            }
            Err(e) => {
                log::error!("update_one on '{}' failed: {e}", self.name);
                Ok(UpdateReport::failed())
            }
        }
    }

    /// Create an index where the driver supports it. Never fails the caller; returns whether the
    /// index is in place (or the driver has nothing to build).
    pub fn create_index(&self, field: &str, unique: bool) -> bool {
        match self.driver.create_index(&self.name, field, unique) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("create_index {}.{field} failed: {e}", self.name);
                false
            }
        }
    }

    /// Create each `(field, unique)` index; returns how many are in place.
    pub fn ensure_indexes(&self, specs: &[(&str, bool)]) -> usize {
        specs.iter().filter(|(field, unique)| self.create_index(field, *unique)).count()
    }

    /// `find_one` with a Mongo-style filter document.
    ///
    /// # Errors
    /// Returns `QueryError` for unsupported filter operators.
    pub fn find_one_doc(&self, filter: &BsonDocument) -> Result<Option<BsonDocument>, DbError> {
        Ok(self.find_one(&parse_filter(filter)?))
    }

    /// `find` with a Mongo-style filter document.
    ///
    /// # Errors
    /// Returns `QueryError` for unsupported filter operators.
    pub fn find_doc(&self, filter: &BsonDocument, opts: &FindOptions) -> Result<Cursor, DbError> {
        Ok(self.find(&parse_filter(filter)?, opts))
    }

    /// # Errors
    /// Returns `QueryError` for unsupported filter operators.
    pub fn count_documents_doc(&self, filter: &BsonDocument) -> Result<u64, DbError> {
        Ok(self.count_documents(&parse_filter(filter)?))
    }

    /// `update_one` with Mongo-style filter, update and array-filter documents.
    ///
    /// # Errors
    /// Parse errors and the rejections of [`Collection::update_one`].
    pub fn update_one_doc(
        &self,
        filter: &BsonDocument,
        update: &BsonDocument,
        upsert: bool,
        array_filters: &[BsonDocument],
    ) -> Result<UpdateReport, DbError> {
        let filter = parse_filter(filter)?;
        let update = parse_update(update)?;
        let array_filters = parse_array_filters(array_filters)?;
        self.update_one(&filter, &update, upsert, &array_filters)
    }
}

fn audit_key(filter: &Filter) -> String {
    IDENTITY_FIELDS
        .iter()
        .find_map(|f| filter.equality_on(f))
        .map_or_else(|| "-".to_string(), |v| match v {
            Bson::String(s) => s.clone(),
            other => other.to_string(),
        })
}
