use bson::Document as BsonDocument;
use std::cmp::Ordering;

use super::eval::{compare_bson, get_path};
use super::types::{Order, SortSpec};

const MAX_SORT_FIELDS: usize = 8;

/// Lazy, single-pass result sequence.
///
/// `sort`, `skip` and `limit` may be chained in any order; they are applied once, at the first
/// iteration, always as sort, then skip, then limit.
#[derive(Debug, Clone, Default)]
pub struct Cursor {
    docs: Vec<BsonDocument>,
    sort: Vec<SortSpec>,
    skip: usize,
    limit: Option<usize>,
    started: bool,
    pos: usize,
}

impl Cursor {
    #[must_use]
    pub fn new(docs: Vec<BsonDocument>) -> Self {
        Self { docs, ..Self::default() }
    }

    /// Add a sort key. Later calls break ties of earlier ones.
    #[must_use]
    pub fn sort(mut self, field: impl Into<String>, order: Order) -> Self {
        if self.sort.len() < MAX_SORT_FIELDS {
            self.sort.push(SortSpec { field: field.into(), order });
        } else {
            log::warn!("sort spec too long, ignoring extra key");
        }
        self
    }

    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        if !self.sort.is_empty() {
            let keys = &self.sort;
            // stable: ties keep backend order
            self.docs.sort_by(|a, b| compare_docs(a, b, keys));
        }
        let skip = self.skip.min(self.docs.len());
        self.docs.drain(..skip);
        if let Some(limit) = self.limit {
            self.docs.truncate(limit);
        }
    }

    /// Drain the remaining results.
    #[must_use]
    pub fn to_vec(mut self) -> Vec<BsonDocument> {
        self.start();
        self.docs.split_off(self.pos)
    }
}

impl Iterator for Cursor {
    type Item = BsonDocument;

    fn next(&mut self) -> Option<Self::Item> {
        self.start();
        let d = self.docs.get_mut(self.pos).map(std::mem::take)?;
        self.pos += 1;
        Some(d)
    }
}

fn compare_docs(a: &BsonDocument, b: &BsonDocument, keys: &[SortSpec]) -> Ordering {
    for k in keys {
        let ord = match (get_path(a, &k.field), get_path(b, &k.field)) {
            (Some(x), Some(y)) => compare_bson(x, y),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        let ord = match k.order {
            Order::Asc => ord,
            Order::Desc => ord.reverse(),
        };
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}
