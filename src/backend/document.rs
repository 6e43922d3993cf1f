use bson::{Bson, Document as BsonDocument};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::{BackendKind, Driver, snapshot, synthesize_upsert};
use crate::errors::DbError;
use crate::query::{ArrayFilter, Filter, UpdateDoc, UpdateReport, apply_update, eval_filter, project_fields};

/// Equality index over one top-level field. Array values are indexed per element.
#[derive(Debug, Clone)]
struct FieldIndex {
    field: String,
    unique: bool,
    entries: HashMap<String, Vec<usize>>,
}

impl FieldIndex {
    fn new(field: &str, unique: bool) -> Self {
        Self { field: field.to_string(), unique, entries: HashMap::new() }
    }

    fn keys_of(&self, doc: &BsonDocument) -> Vec<String> {
        match doc.get(&self.field) {
            None | Some(Bson::Null) => Vec::new(),
            Some(Bson::Array(items)) => items.iter().map(index_key).collect(),
            Some(v) => vec![index_key(v)],
        }
    }

    fn insert(&mut self, pos: usize, doc: &BsonDocument) {
        for k in self.keys_of(doc) {
            let slot = self.entries.entry(k).or_default();
            if !slot.contains(&pos) {
                slot.push(pos);
            }
        }
    }

    fn remove(&mut self, pos: usize, doc: &BsonDocument) {
        for k in self.keys_of(doc) {
            if let Some(slot) = self.entries.get_mut(&k) {
                slot.retain(|p| *p != pos);
                if slot.is_empty() {
                    self.entries.remove(&k);
                }
            }
        }
    }

    /// First key of `doc` already held by a document other than `own`.
    fn conflict(&self, doc: &BsonDocument, own: Option<usize>) -> Option<String> {
        self.keys_of(doc)
            .into_iter()
            .find(|k| self.entries.get(k).is_some_and(|ps| ps.iter().any(|p| Some(*p) != own)))
    }
}

/// Numbers share one key space so an `Int32` probe finds an `Int64` entry.
#[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
fn index_key(v: &Bson) -> String {
    match v {
        Bson::Int32(i) => format!("n:{i}"),
        Bson::Int64(i) => format!("n:{i}"),
        Bson::Double(f) if f.fract() == 0.0 && f.is_finite() => format!("n:{}", *f as i64),
        Bson::String(s) => format!("s:{s}"),
        other => format!("j:{}", other.clone().into_relaxed_extjson()),
    }
}

#[derive(Debug, Default)]
struct DocSet {
    docs: Vec<BsonDocument>,
    indexes: Vec<FieldIndex>,
}

impl DocSet {
    /// Positions worth evaluating: narrowed by an index when the filter pins an indexed field.
    fn candidates(&self, filter: &Filter) -> Vec<usize> {
        for ix in &self.indexes {
            if let Some(v) = filter.equality_on(&ix.field)
                && !matches!(v, Bson::Null | Bson::Array(_))
            {
                let mut ps = ix.entries.get(&index_key(v)).cloned().unwrap_or_default();
                ps.sort_unstable();
                return ps;
            }
        }
        (0..self.docs.len()).collect()
    }

    fn first_match(&self, filter: &Filter) -> Option<usize> {
        self.candidates(filter).into_iter().find(|p| self.docs.get(*p).is_some_and(|d| eval_filter(d, filter)))
    }

    fn check_unique(&self, doc: &BsonDocument, own: Option<usize>) -> Result<(), DbError> {
        for ix in self.indexes.iter().filter(|ix| ix.unique) {
            if let Some(key) = ix.conflict(doc, own) {
                return Err(DbError::DuplicateKey { index: ix.field.clone(), key });
            }
        }
        Ok(())
    }

    fn replace(&mut self, pos: usize, doc: BsonDocument) -> BsonDocument {
        let old = std::mem::replace(&mut self.docs[pos], doc);
        for ix in &mut self.indexes {
            ix.remove(pos, &old);
            ix.insert(pos, &self.docs[pos]);
        }
        old
    }

    fn push(&mut self, doc: BsonDocument) {
        let pos = self.docs.len();
        for ix in &mut self.indexes {
            ix.insert(pos, &doc);
        }
        self.docs.push(doc);
    }

    fn pop(&mut self) {
        if let Some(doc) = self.docs.pop() {
            let pos = self.docs.len();
            for ix in &mut self.indexes {
                ix.remove(pos, &doc);
            }
        }
    }
}

/// Native document store: documents live in memory behind one lock per driver, writes are
/// atomic per document, and each collection is optionally mirrored to an NDJSON file.
pub struct DocumentDriver {
    data_dir: Option<PathBuf>,
    collections: RwLock<HashMap<String, DocSet>>,
}

impl DocumentDriver {
    /// Purely in-memory driver.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { data_dir: None, collections: RwLock::new(HashMap::new()) }
    }

    /// Driver persisting each collection to `{dir}/{collection}.ndjson`.
    #[must_use]
    pub fn persistent(dir: impl Into<PathBuf>) -> Self {
        Self { data_dir: Some(dir.into()), collections: RwLock::new(HashMap::new()) }
    }

    fn file_for(dir: &Path, collection: &str) -> PathBuf {
        dir.join(format!("{collection}.ndjson"))
    }

    fn entry<'a>(&self, map: &'a mut HashMap<String, DocSet>, name: &str) -> Result<&'a mut DocSet, DbError> {
        if !map.contains_key(name) {
            validate_collection_name(name)?;
            let docs = match &self.data_dir {
                Some(dir) => snapshot::load(&Self::file_for(dir, name))?,
                None => Vec::new(),
            };
            log::debug!("document driver: opened collection '{name}' ({} documents)", docs.len());
            map.insert(name.to_string(), DocSet { docs, indexes: Vec::new() });
        }
        map.get_mut(name).ok_or_else(|| DbError::NoSuchCollection(name.to_string()))
    }

    fn with_read<T>(&self, name: &str, f: impl FnOnce(&DocSet) -> T) -> Result<T, DbError> {
        {
            let map = self.collections.read();
            if let Some(set) = map.get(name) {
                return Ok(f(set));
            }
        }
        let mut map = self.collections.write();
        let set = self.entry(&mut map, name)?;
        Ok(f(set))
    }

    fn persist(&self, name: &str, set: &DocSet) -> Result<(), DbError> {
        match &self.data_dir {
            Some(dir) => snapshot::save(&Self::file_for(dir, name), &set.docs),
            None => Ok(()),
        }
    }
}

/// Collection names become file names, so they are restricted to a portable alphabet.
pub(crate) fn validate_collection_name(name: &str) -> Result<(), DbError> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(DbError::NoSuchCollection(name.to_string()));
    }
    Ok(())
}

impl Driver for DocumentDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::Document
    }

    fn find_one(&self, collection: &str, filter: &Filter) -> Result<Option<BsonDocument>, DbError> {
        self.with_read(collection, |set| set.first_match(filter).and_then(|p| set.docs.get(p).cloned()))
    }

    fn find(
        &self,
        collection: &str,
        filter: &Filter,
        projection: Option<&[String]>,
    ) -> Result<Vec<BsonDocument>, DbError> {
        self.with_read(collection, |set| {
            set.candidates(filter)
                .into_iter()
                .filter_map(|p| set.docs.get(p))
                .filter(|d| eval_filter(d, filter))
                .map(|d| match projection {
                    Some(fields) => project_fields(d, fields),
                    None => d.clone(),
                })
                .collect()
        })
    }

    fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateDoc,
        upsert: bool,
        array_filters: &[ArrayFilter],
    ) -> Result<UpdateReport, DbError> {
        let mut map = self.collections.write();
        let set = self.entry(&mut map, collection)?;
        match set.first_match(filter) {
            Some(pos) => {
                let mut next = set.docs[pos].clone();
                if !apply_update(&mut next, update, array_filters, false)? {
                    return Ok(UpdateReport::matched(false));
                }
                set.check_unique(&next, Some(pos))?;
                let old = set.replace(pos, next);
                if let Err(e) = self.persist(collection, set) {
                    set.replace(pos, old);
                    return Err(e);
                }
                Ok(UpdateReport::matched(true))
            }
            None if upsert => {
                let doc = synthesize_upsert(filter, update, array_filters)?;
                set.check_unique(&doc, None)?;
                set.push(doc);
                if let Err(e) = self.persist(collection, set) {
                    set.pop();
                    return Err(e);
                }
                Ok(UpdateReport::inserted())
            }
            None => Ok(UpdateReport::unmatched()),
        }
    }

    fn create_index(&self, collection: &str, field: &str, unique: bool) -> Result<(), DbError> {
        let mut map = self.collections.write();
        let set = self.entry(&mut map, collection)?;
        if let Some(existing) = set.indexes.iter().find(|ix| ix.field == field) {
            if existing.unique != unique {
                log::warn!("index on {collection}.{field} already exists with unique={}", existing.unique);
            }
            return Ok(());
        }
        let mut ix = FieldIndex::new(field, unique);
        for (pos, doc) in set.docs.iter().enumerate() {
            if unique && let Some(key) = ix.conflict(doc, Some(pos)) {
                return Err(DbError::DuplicateKey { index: field.to_string(), key });
            }
            ix.insert(pos, doc);
        }
        log::info!("document driver: index on {collection}.{field} (unique={unique}, {} keys)", ix.entries.len());
        set.indexes.push(ix);
        Ok(())
    }
}
