use bson::Bson;
use serde::{Deserialize, Serialize};

// Safety limits to prevent resource abuse
pub(crate) const MAX_PATH_DEPTH: usize = 32;
pub(crate) const MAX_IN_SET: usize = 1000;
pub(crate) const MAX_UPDATE_PATHS: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Order {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SortSpec {
    pub field: String,
    pub order: Order,
}

/// Options for `find`.
///
/// Only inclusion projections are modelled: when `projection` is `Some(fields)` the returned
/// documents keep just those top-level fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindOptions {
    pub projection: Option<Vec<String>>,
}

/// Mongo-subset filter tree.
///
/// Paths are dotted; traversal into arrays fans out over the elements.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    True,
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Eq { path: String, value: Bson },
    In { path: String, values: Vec<Bson> },
}

impl Filter {
    #[must_use]
    pub fn eq(path: impl Into<String>, value: impl Into<Bson>) -> Self {
        Self::Eq { path: path.into(), value: value.into() }
    }

    /// Conjunction that flattens nested `And`s and drops `True`.
    #[must_use]
    pub fn and(parts: Vec<Filter>) -> Self {
        let mut out = Vec::with_capacity(parts.len());
        for p in parts {
            match p {
                Self::True => {}
                Self::And(inner) => out.extend(inner),
                other => out.push(other),
            }
        }
        match out.len() {
            0 => Self::True,
            1 => out.remove(0),
            _ => Self::And(out),
        }
    }

    /// The value bound to `path` when the filter pins it with a top-level equality.
    #[must_use]
    pub fn equality_on(&self, path: &str) -> Option<&Bson> {
        match self {
            Self::Eq { path: p, value } if p == path => Some(value),
            Self::And(parts) => parts.iter().find_map(|f| f.equality_on(path)),
            _ => None,
        }
    }

    /// Top-level, non-dotted equality constraints; used to seed upserted documents.
    #[must_use]
    pub fn seed_fields(&self) -> Vec<(&str, &Bson)> {
        match self {
            Self::Eq { path, value } if !path.contains('.') => vec![(path.as_str(), value)],
            Self::And(parts) => parts.iter().flat_map(Self::seed_fields).collect(),
            _ => Vec::new(),
        }
    }
}

/// Condition applied to a single array element (`$pull` targets and array filters).
#[derive(Debug, Clone, PartialEq)]
pub enum ElemCondition {
    /// The element itself must equal the value.
    Value(Bson),
    /// The element must be a document satisfying the filter (partial dict match, `$or`, `$in`).
    Matches(Filter),
}

/// Named element condition resolving a `$[name]` placeholder.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayFilter {
    pub name: String,
    pub condition: ElemCondition,
}

/// One mutation of an update document; applied by exhaustive match in the update engine.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOp {
    Set { path: String, value: Bson },
    SetOnInsert { path: String, value: Bson },
    Pull { path: String, condition: ElemCondition },
    Push { path: String, value: Bson },
}

impl UpdateOp {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            Self::Set { path, .. }
            | Self::SetOnInsert { path, .. }
            | Self::Pull { path, .. }
            | Self::Push { path, .. } => path,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct UpdateDoc {
    pub ops: Vec<UpdateOp>,
}

impl UpdateDoc {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn set(mut self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Set { path: path.into(), value: value.into() });
        self
    }

    #[must_use]
    pub fn set_on_insert(mut self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::SetOnInsert { path: path.into(), value: value.into() });
        self
    }

    #[must_use]
    pub fn pull(mut self, path: impl Into<String>, condition: ElemCondition) -> Self {
        self.ops.push(UpdateOp::Pull { path: path.into(), condition });
        self
    }

    #[must_use]
    pub fn push(mut self, path: impl Into<String>, value: impl Into<Bson>) -> Self {
        self.ops.push(UpdateOp::Push { path: path.into(), value: value.into() });
        self
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Outcome of `update_one`.
///
/// `failed` is set when the backing store could not complete the write; the counts are then zero.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct UpdateReport {
    pub matched: u64,
    pub modified: u64,
    pub upserted: bool,
    pub failed: bool,
}

impl UpdateReport {
    #[must_use]
    pub const fn unmatched() -> Self {
        Self { matched: 0, modified: 0, upserted: false, failed: false }
    }

    #[must_use]
    pub const fn matched(modified: bool) -> Self {
        Self { matched: 1, modified: modified as u64, upserted: false, failed: false }
    }

    #[must_use]
    pub const fn inserted() -> Self {
        Self { matched: 1, modified: 1, upserted: true, failed: false }
    }

    #[must_use]
    pub const fn failed() -> Self {
        Self { matched: 0, modified: 0, upserted: false, failed: true }
    }
}
