use bson::{Bson, Document as BsonDocument, doc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use super::document::validate_collection_name;
use super::{BackendKind, Driver, snapshot, synthesize_upsert};
use crate::errors::DbError;
use crate::query::{
    ArrayFilter, Filter, FilterExpression, UpdateDoc, UpdateReport, apply_update, eval_filter, project_fields,
    to_filter_expression,
};

pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Stored item: the document plus the key and version the store conditions writes on.
#[derive(Debug, Clone, PartialEq)]
pub struct TableItem {
    pub key: String,
    pub version: u64,
    pub attributes: BsonDocument,
}

impl TableItem {
    fn to_record(&self) -> BsonDocument {
        #[allow(clippy::cast_possible_wrap)]
        let version = self.version as i64;
        doc! { "key": self.key.clone(), "version": version, "item": self.attributes.clone() }
    }

    fn from_record(rec: &BsonDocument) -> Result<Self, DbError> {
        let bad = || DbError::Decode("table record needs key, version and item".into());
        let key = rec.get_str("key").map_err(|_| bad())?.to_string();
        let version = match rec.get("version") {
            Some(Bson::Int64(v)) => u64::try_from(*v).map_err(|_| bad())?,
            Some(Bson::Int32(v)) => u64::try_from(*v).map_err(|_| bad())?,
            _ => return Err(bad()),
        };
        let attributes = rec.get_document("item").map_err(|_| bad())?.clone();
        Ok(Self { key, version, attributes })
    }
}

/// Write precondition for `put_item`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    Always,
    /// `attribute_not_exists(key)`
    NotExists,
    /// The stored item must still carry this version.
    VersionEquals(u64),
}

#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<TableItem>,
    /// Continuation key; `None` once the table is exhausted.
    pub last_evaluated_key: Option<String>,
}

/// Key/value tables with conditional puts and paged scans.
///
/// Scans evaluate `Limit` before the filter expression, so a page may come back empty while more
/// pages remain; callers must follow `last_evaluated_key` to the end.
pub struct TableStore {
    data_dir: Option<PathBuf>,
    tables: RwLock<HashMap<String, BTreeMap<String, TableItem>>>,
    available: AtomicBool,
}

impl TableStore {
    #[must_use]
    pub fn in_memory() -> Self {
        Self { data_dir: None, tables: RwLock::new(HashMap::new()), available: AtomicBool::new(true) }
    }

    /// Store persisting each table to `{dir}/{table}.table.ndjson`.
    #[must_use]
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: Some(dir.into()), tables: RwLock::new(HashMap::new()), available: AtomicBool::new(true) }
    }

    /// Simulate losing (or regaining) the connection to the store.
    pub fn set_available(&self, up: bool) {
        self.available.store(up, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DbError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(DbError::Unavailable("table store is not reachable".into()))
        }
    }

    fn file_for(dir: &Path, table: &str) -> PathBuf {
        dir.join(format!("{table}.table.ndjson"))
    }

    fn load_table(&self, table: &str) -> Result<BTreeMap<String, TableItem>, DbError> {
        let mut items = BTreeMap::new();
        if let Some(dir) = &self.data_dir {
            for rec in snapshot::load(&Self::file_for(dir, table))? {
                let item = TableItem::from_record(&rec)?;
                items.insert(item.key.clone(), item);
            }
        }
        Ok(items)
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&BTreeMap<String, TableItem>) -> T) -> Result<T, DbError> {
        self.check_available()?;
        {
            let tables = self.tables.read();
            if let Some(t) = tables.get(table) {
                return Ok(f(t));
            }
        }
        validate_collection_name(table)?;
        let mut tables = self.tables.write();
        if !tables.contains_key(table) {
            let loaded = self.load_table(table)?;
            tables.insert(table.to_string(), loaded);
        }
        tables.get(table).map(f).ok_or_else(|| DbError::NoSuchCollection(table.to_string()))
    }

    /// # Errors
    /// `Unavailable` when the store is unreachable.
    pub fn get_item(&self, table: &str, key: &str) -> Result<Option<TableItem>, DbError> {
        self.with_table(table, |t| t.get(key).cloned())
    }

    fn with_table_mut<T>(
        &self,
        table: &str,
        f: impl FnOnce(&mut BTreeMap<String, TableItem>) -> Result<T, DbError>,
    ) -> Result<T, DbError> {
        self.check_available()?;
        validate_collection_name(table)?;
        let mut tables = self.tables.write();
        if !tables.contains_key(table) {
            let loaded = self.load_table(table)?;
            tables.insert(table.to_string(), loaded);
        }
        let Some(items) = tables.get_mut(table) else {
            return Err(DbError::NoSuchCollection(table.to_string()));
        };
        let before = self.data_dir.as_ref().map(|_| items.clone());
        let out = f(items)?;
        if let (Some(dir), Some(before)) = (&self.data_dir, before) {
            let records: Vec<BsonDocument> = items.values().map(TableItem::to_record).collect();
            if let Err(e) = snapshot::save(&Self::file_for(dir, table), &records) {
                *items = before;
                return Err(e);
            }
        }
        Ok(out)
    }

    /// Write `attributes` under `key` when `condition` holds; returns the new version.
    ///
    /// # Errors
    /// `ConditionalCheckFailed` when the precondition does not hold, `Unavailable` when the store
    /// is unreachable, and I/O errors from persistence (the write is then rolled back).
    pub fn put_item(
        &self,
        table: &str,
        key: &str,
        attributes: BsonDocument,
        condition: PutCondition,
    ) -> Result<u64, DbError> {
        self.with_table_mut(table, |items| {
            let current = items.get(key).map(|i| i.version);
            let ok = match condition {
                PutCondition::Always => true,
                PutCondition::NotExists => current.is_none(),
                PutCondition::VersionEquals(v) => current == Some(v),
            };
            if !ok {
                return Err(DbError::ConditionalCheckFailed(key.to_string()));
            }
            let version = current.map_or(1, |v| v + 1);
            items.insert(key.to_string(), TableItem { key: key.to_string(), version, attributes });
            Ok(version)
        })
    }

    /// Move the item at `from` (still at `version`) to the free key `to`, in one write.
    ///
    /// # Errors
    /// `ConditionalCheckFailed` when `from` changed since it was read, `DuplicateKey` when `to` is
    /// taken, and the errors of [`TableStore::put_item`].
    pub fn move_item(
        &self,
        table: &str,
        from: &str,
        to: &str,
        version: u64,
        attributes: BsonDocument,
    ) -> Result<u64, DbError> {
        self.with_table_mut(table, |items| {
            if items.get(from).map(|i| i.version) != Some(version) {
                return Err(DbError::ConditionalCheckFailed(from.to_string()));
            }
            if items.contains_key(to) {
                return Err(DbError::DuplicateKey { index: KEY_ATTRIBUTE.to_string(), key: to.to_string() });
            }
            items.remove(from);
            items.insert(to.to_string(), TableItem { key: to.to_string(), version: version + 1, attributes });
            Ok(version + 1)
        })
    }

    /// One page of at most `limit` examined items after `start_key`, filtered afterwards.
    ///
    /// # Errors
    /// `Unavailable` when the store is unreachable.
    pub fn scan(
        &self,
        table: &str,
        filter: &FilterExpression,
        limit: usize,
        start_key: Option<&str>,
    ) -> Result<ScanPage, DbError> {
        let limit = limit.max(1);
        self.with_table(table, |t| {
            let lower = start_key.map_or(Bound::Unbounded, |k| Bound::Excluded(k.to_string()));
            let mut examined = t.range((lower, Bound::Unbounded));
            let mut page = ScanPage::default();
            let mut last = None;
            for item in examined.by_ref().take(limit).map(|(_, item)| item) {
                last = Some(item.key.clone());
                if filter.matches(&item.attributes) {
                    page.items.push(item.clone());
                }
            }
            if examined.next().is_some() {
                page.last_evaluated_key = last;
            }
            page
        })
    }
}

/// Attribute the table driver keys items by.
pub const KEY_ATTRIBUTE: &str = "order_id";

/// Driver over `TableStore`: key lookups for `order_id` filters, paged scans with a filter
/// pushdown otherwise, and read-modify-write updates guarded by the item version.
///
/// An item's key is always its string `order_id`; items without one get a generated key, and an
/// update that changes `order_id` moves the item to its new key.
pub struct TableDriver {
    store: Arc<TableStore>,
    prefix: String,
    page_size: usize,
    auto_keys: AtomicU64,
}

impl TableDriver {
    #[must_use]
    pub fn new(store: Arc<TableStore>, prefix: impl Into<String>, page_size: usize) -> Self {
        Self { store, prefix: prefix.into(), page_size: page_size.max(1), auto_keys: AtomicU64::new(0) }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<TableStore> {
        &self.store
    }

    fn table(&self, collection: &str) -> String {
        format!("{}{collection}", self.prefix)
    }

    /// Every item the pushdown admits, following continuation keys to the end.
    fn scan_all(&self, table: &str, filter: &Filter) -> Result<Vec<TableItem>, DbError> {
        let pushdown = to_filter_expression(filter);
        if !pushdown.is_empty() {
            log::debug!("table scan {table}: {}", pushdown.expression());
        }
        let mut out = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let page = self.store.scan(table, &pushdown, self.page_size, start.as_deref())?;
            out.extend(page.items.into_iter().filter(|i| eval_filter(&i.attributes, filter)));
            match page.last_evaluated_key {
                Some(k) => start = Some(k),
                None => break,
            }
        }
        Ok(out)
    }

    /// The single item `filter` targets, if any.
    fn locate(&self, table: &str, filter: &Filter) -> Result<Option<TableItem>, DbError> {
        if let Some(key) = item_key(filter.equality_on(KEY_ATTRIBUTE)) {
            let item = self.store.get_item(table, key)?;
            return Ok(item.filter(|i| eval_filter(&i.attributes, filter)));
        }
        Ok(self.scan_all(table, filter)?.into_iter().next())
    }

    fn auto_key(&self) -> String {
        let n = self.auto_keys.fetch_add(1, Ordering::SeqCst);
        let stamp = chrono::Utc::now().timestamp_micros();
        format!("auto-{stamp}-{n}")
    }

    /// Key for `next`, the updated attributes of `item`.
    fn key_after(&self, item: &TableItem, next: &BsonDocument) -> String {
        match item_key(next.get(KEY_ATTRIBUTE)) {
            Some(k) => k.to_string(),
            // the old key came from an order_id the item no longer carries
            None if item_key(item.attributes.get(KEY_ATTRIBUTE)).is_some() => self.auto_key(),
            None => item.key.clone(),
        }
    }
}

/// Only string identities are keys; anything else is found by scanning.
fn item_key(v: Option<&Bson>) -> Option<&str> {
    match v {
        Some(Bson::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

impl Driver for TableDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Table
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<BsonDocument>, DbError> {
        Ok(self.locate(&self.table(collection), filter)?.map(|i| i.attributes))
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[String]>,
    ) -> Result<Vec<BsonDocument>, DbError> {
        let items = self.scan_all(&self.table(collection), filter)?;
        Ok(items
            .into_iter()
            .map(|i| match projection {
                Some(fields) => project_fields(&i.attributes, fields),
                None => i.attributes,
            })
            .collect())
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        upsert: bool,
        array_filters: &[ArrayFilter],
    ) -> Result<UpdateReport, DbError> {
        let table = self.table(collection);
        let written = match self.locate(&table, filter)? {
            Some(item) => {
                let mut next = item.attributes.clone();
                if !apply_update(&mut next, update, array_filters, false)? {
                    return Ok(UpdateReport::matched(false));
                }
                let key = self.key_after(&item, &next);
                let put = if key == item.key {
                    self.store.put_item(&table, &key, next, PutCondition::VersionEquals(item.version))
                } else {
                    log::debug!("table {table}: moving '{}' to '{key}'", item.key);
                    self.store.move_item(&table, &item.key, &key, item.version, next)
                };
                put.map(|_| UpdateReport::matched(true))
            }
            None if upsert => {
                let doc = synthesize_upsert(filter, update, array_filters)?;
                let key = item_key(doc.get(KEY_ATTRIBUTE)).map_or_else(|| self.auto_key(), str::to_string);
                self.store.put_item(&table, &key, doc, PutCondition::NotExists).map(|_| UpdateReport::inserted())
            }
            None => return Ok(UpdateReport::unmatched()),
        };
        match written {
            Err(DbError::ConditionalCheckFailed(k)) => {
                // a concurrent writer got there first; the guarded write simply did not match
                log::warn!("table {table}: conditional write on '{k}' lost to a concurrent update");
                Ok(UpdateReport::unmatched())
            }
            other => other,
        }
    }

    fn create_index(&self, collection: &str, field: &str, _unique: bool) -> Result<(), DbError> {
        log::debug!("table driver: no secondary indexes, ignoring {}.{field}", self.table(collection));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(n: usize) -> Arc<TableStore> {
        let s = Arc::new(TableStore::in_memory());
        for i in 0..n {
            let attrs = doc! { "order_id": format!("o-{i:02}"), "even": i % 2 == 0 };
            s.put_item("orders", &format!("o-{i:02}"), attrs, PutCondition::NotExists).unwrap();
        }
        s
    }

    #[test]
    fn limit_applies_before_filter() {
        let s = store_with(5);
        let fe = to_filter_expression(&Filter::eq("order_id", "o-04"));
        let first = s.scan("orders", &fe, 2, None).unwrap();
        assert!(first.items.is_empty());
        assert_eq!(first.last_evaluated_key.as_deref(), Some("o-01"));
        let second = s.scan("orders", &fe, 2, first.last_evaluated_key.as_deref()).unwrap();
        assert!(second.items.is_empty());
        let third = s.scan("orders", &fe, 2, second.last_evaluated_key.as_deref()).unwrap();
        assert_eq!(third.items.len(), 1);
        assert!(third.last_evaluated_key.is_none());
    }

    #[test]
    fn driver_drains_every_page() {
        let d = TableDriver::new(store_with(7), "", 2);
        let found = d.find_one("orders", &Filter::eq("even", false)).unwrap().unwrap();
        assert_eq!(found.get_str("order_id").unwrap(), "o-01");
        assert_eq!(d.find("orders", &Filter::eq("even", true), None).unwrap().len(), 4);
    }

    #[test]
    fn conditional_put() {
        let s = store_with(1);
        let err = s.put_item("orders", "o-00", doc! {}, PutCondition::NotExists).unwrap_err();
        assert!(matches!(err, DbError::ConditionalCheckFailed(_)));
        assert_eq!(s.put_item("orders", "o-00", doc! { "a": 1 }, PutCondition::VersionEquals(1)).unwrap(), 2);
        assert!(s.put_item("orders", "o-00", doc! {}, PutCondition::VersionEquals(1)).is_err());
    }

    #[test]
    fn update_honours_non_key_filter_fields() {
        let d = TableDriver::new(store_with(2), "", 10);
        let guard = Filter::and(vec![Filter::eq("order_id", "o-00"), Filter::eq("even", false)]);
        let r = d.update_one("orders", &guard, &UpdateDoc::new().set("x", 1), false, &[]).unwrap();
        assert_eq!(r, UpdateReport::unmatched());
    }

    #[test]
    fn move_item_checks_version_and_target() {
        let s = store_with(2);
        let moved = s.move_item("orders", "o-00", "o-09", 1, doc! { "order_id": "o-09" }).unwrap();
        assert_eq!(moved, 2);
        assert!(s.get_item("orders", "o-00").unwrap().is_none());
        let stale = s.move_item("orders", "o-09", "o-10", 1, doc! {}).unwrap_err();
        assert!(matches!(stale, DbError::ConditionalCheckFailed(_)));
        let taken = s.move_item("orders", "o-09", "o-01", 2, doc! {}).unwrap_err();
        assert!(matches!(taken, DbError::DuplicateKey { .. }));
    }

    #[test]
    fn nulling_the_key_attribute_frees_the_key() {
        let d = TableDriver::new(store_with(1), "", 10);
        let r = d.update_one("orders", &Filter::eq("order_id", "o-00"), &UpdateDoc::new().set("order_id", Bson::Null), false, &[]).unwrap();
        assert_eq!(r, UpdateReport::matched(true));
        assert!(d.store().get_item("orders", "o-00").unwrap().is_none());
        assert_eq!(d.find("orders", &Filter::eq("even", true), None).unwrap().len(), 1);
        let again = d.update_one("orders", &Filter::eq("order_id", "o-00"), &UpdateDoc::new().set("n", 1), true, &[]).unwrap();
        assert!(again.upserted);
    }

    #[test]
    fn unavailable_store_errors() {
        let s = store_with(1);
        s.set_available(false);
        assert!(matches!(s.get_item("orders", "o-00"), Err(DbError::Unavailable(_))));
    }

    #[test]
    fn persisted_tables_reload_with_versions() {
        let dir = tempfile::tempdir().unwrap();
        {
            let s = TableStore::persistent(dir.path());
            s.put_item("t_orders", "o-1", doc! { "order_id": "o-1" }, PutCondition::NotExists).unwrap();
            s.put_item("t_orders", "o-1", doc! { "order_id": "o-1", "n": 2 }, PutCondition::VersionEquals(1)).unwrap();
        }
        let s = TableStore::persistent(dir.path());
        let item = s.get_item("t_orders", "o-1").unwrap().unwrap();
        assert_eq!(item.version, 2);
        assert!(matches!(item.attributes.get("n"), Some(Bson::Int32(2) | Bson::Int64(2))));
    }
}
