//! Update engine: applies a validated `UpdateDoc` to a document copy.
//!
//! Every path may carry one `$[name]` placeholder. The placeholder is expanded into the concrete
//! positions of the array elements that satisfy the named array filter, so the mutation itself
//! only ever walks plain dotted paths (documents plus numeric array positions).

use bson::{Bson, Document as BsonDocument};
use std::collections::HashSet;

use super::eval::{elem_matches, get_path, values_equal};
use super::types::{ArrayFilter, MAX_PATH_DEPTH, MAX_UPDATE_PATHS, UpdateDoc, UpdateOp};
use crate::errors::DbError;

/// Reject malformed updates before any document is touched.
///
/// # Errors
/// Returns `DbError::MalformedOperation` when a path is empty or too deep, a placeholder names no
/// array filter, a path carries more than one placeholder, array filters repeat a name, or
/// `$setOnInsert` and `$set` address the same (or an overlapping) path.
pub fn validate_update(update: &UpdateDoc, array_filters: &[ArrayFilter]) -> Result<(), DbError> {
    if update.ops.len() > MAX_UPDATE_PATHS {
        return Err(DbError::MalformedOperation(format!("too many update paths: {}", update.ops.len())));
    }
    let mut names = HashSet::new();
    for af in array_filters {
        if !names.insert(af.name.as_str()) {
            return Err(DbError::MalformedOperation(format!("duplicate array filter '{}'", af.name)));
        }
    }
    for op in &update.ops {
        let path = op.path();
        let segs: Vec<&str> = path.split('.').collect();
        if path.is_empty() || segs.iter().any(|s| s.is_empty()) {
            return Err(DbError::MalformedOperation(format!("invalid update path '{path}'")));
        }
        if segs.len() > MAX_PATH_DEPTH {
            return Err(DbError::MalformedOperation(format!("update path too deep: '{path}'")));
        }
        let mut placeholders = 0usize;
        for seg in &segs {
            if let Some(name) = placeholder_name(seg) {
                placeholders += 1;
                if !names.contains(name) {
                    return Err(DbError::MalformedOperation(format!(
                        "no array filter found for identifier '{name}' in path '{path}'"
                    )));
                }
            } else if seg.starts_with('$') {
                return Err(DbError::MalformedOperation(format!(
                    "unsupported positional segment '{seg}' in '{path}'"
                )));
            }
        }
        if placeholders > 1 {
            return Err(DbError::MalformedOperation(format!("more than one placeholder in '{path}'")));
        }
        if placeholders == 1 && segs.first().is_some_and(|s| placeholder_name(s).is_some()) {
            return Err(DbError::MalformedOperation(format!("placeholder cannot lead path '{path}'")));
        }
    }
    for ins in update.ops.iter().filter(|o| matches!(o, UpdateOp::SetOnInsert { .. })) {
        for set in update.ops.iter().filter(|o| matches!(o, UpdateOp::Set { .. })) {
            if paths_overlap(ins.path(), set.path()) {
                return Err(DbError::MalformedOperation(format!(
                    "'{}' appears in both $setOnInsert and $set",
                    ins.path()
                )));
            }
        }
    }
    Ok(())
}

/// Apply `update` to `doc`. `inserting` enables `$setOnInsert`.
///
/// Operators run in a fixed order: `$setOnInsert` (insert only), `$set`, `$pull`, `$push`.
/// Returns whether the document changed. On error the document may be partially mutated, so
/// callers must pass a copy.
///
/// # Errors
/// Returns `DbError::MalformedOperation` for invalid updates or when a path runs into a value
/// of the wrong shape.
pub fn apply_update(
    doc: &mut BsonDocument,
    update: &UpdateDoc,
    array_filters: &[ArrayFilter],
    inserting: bool,
) -> Result<bool, DbError> {
    validate_update(update, array_filters)?;
    let mut changed = false;
    for pass in 0..4u8 {
        for op in &update.ops {
            let rank = match op {
                UpdateOp::SetOnInsert { .. } => 0,
                UpdateOp::Set { .. } => 1,
                UpdateOp::Pull { .. } => 2,
                UpdateOp::Push { .. } => 3,
            };
            if rank != pass || (rank == 0 && !inserting) {
                continue;
            }
            for path in expand_path(doc, op.path(), array_filters) {
                changed |= match op {
                    UpdateOp::SetOnInsert { value, .. } | UpdateOp::Set { value, .. } => {
                        set_path(doc, &path, value.clone())?
                    }
                    UpdateOp::Pull { condition, .. } => pull_path(doc, &path, |e| elem_matches(e, condition))?,
                    UpdateOp::Push { value, .. } => push_path(doc, &path, value.clone())?,
                };
            }
        }
    }
    Ok(changed)
}

fn placeholder_name(seg: &str) -> Option<&str> {
    seg.strip_prefix("$[").and_then(|s| s.strip_suffix(']')).filter(|n| !n.is_empty())
}

fn paths_overlap(a: &str, b: &str) -> bool {
    let (a, b): (Vec<&str>, Vec<&str>) = (a.split('.').collect(), b.split('.').collect());
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

/// Resolve the placeholder (if any) into concrete dotted paths.
fn expand_path(doc: &BsonDocument, path: &str, array_filters: &[ArrayFilter]) -> Vec<String> {
    let segs: Vec<&str> = path.split('.').collect();
    let Some(pos) = segs.iter().position(|s| placeholder_name(s).is_some()) else {
        return vec![path.to_string()];
    };
    let name = placeholder_name(segs[pos]).unwrap_or_default();
    let Some(af) = array_filters.iter().find(|af| af.name == name) else {
        return Vec::new();
    };
    let prefix = segs[..pos].join(".");
    let suffix = segs[pos + 1..].join(".");
    let Some(Bson::Array(items)) = get_path(doc, &prefix) else {
        log::debug!("placeholder parent '{prefix}' is not an array; skipping '{path}'");
        return Vec::new();
    };
    items
        .iter()
        .enumerate()
        .filter(|(_, e)| elem_matches(e, &af.condition))
        .map(|(i, _)| if suffix.is_empty() { format!("{prefix}.{i}") } else { format!("{prefix}.{i}.{suffix}") })
        .collect()
}

enum Slot<'a> {
    Doc(&'a mut BsonDocument),
    Arr(&'a mut Vec<Bson>),
}

/// Walk to the container holding the last segment of `segs`.
///
/// With `create`, missing (or null) intermediate fields become empty documents. `Ok(None)` means
/// the path is absent and nothing should happen.
fn parent_mut<'a>(root: &'a mut BsonDocument, segs: &[&str], create: bool) -> Result<Option<Slot<'a>>, DbError> {
    let mut cur = Slot::Doc(root);
    for seg in segs {
        let next = match cur {
            Slot::Doc(d) => {
                if create && matches!(d.get(*seg), None | Some(Bson::Null)) {
                    d.insert((*seg).to_string(), Bson::Document(BsonDocument::new()));
                }
                match d.get_mut(*seg) {
                    Some(v) => v,
                    None => return Ok(None),
                }
            }
            Slot::Arr(a) => {
                let Ok(idx) = seg.parse::<usize>() else {
                    return Err(DbError::MalformedOperation(format!("cannot address array with '{seg}'")));
                };
                let len = a.len();
                match a.get_mut(idx) {
                    Some(v) => v,
                    None if create => {
                        return Err(DbError::MalformedOperation(format!(
                            "array position {idx} out of range (len {len})"
                        )));
                    }
                    None => return Ok(None),
                }
            }
        };
        cur = match next {
            Bson::Document(inner) => Slot::Doc(inner),
            Bson::Array(inner) => Slot::Arr(inner),
            _ => return Err(DbError::MalformedOperation(format!("cannot traverse scalar at '{seg}'"))),
        };
    }
    Ok(Some(cur))
}

fn split_leaf(path: &str) -> (Vec<&str>, &str) {
    let mut segs: Vec<&str> = path.split('.').collect();
    let last = segs.pop().unwrap_or_default();
    (segs, last)
}

fn set_path(doc: &mut BsonDocument, path: &str, value: Bson) -> Result<bool, DbError> {
    let (parents, last) = split_leaf(path);
    match parent_mut(doc, &parents, true)? {
        Some(Slot::Doc(d)) => {
            let changed = d.get(last).is_none_or(|old| !values_equal(old, &value));
            if changed {
                d.insert(last.to_string(), value);
            }
            Ok(changed)
        }
        Some(Slot::Arr(a)) => {
            let len = a.len();
            let slot = last
                .parse::<usize>()
                .ok()
                .and_then(|i| a.get_mut(i))
                .ok_or_else(|| DbError::MalformedOperation(format!("array position '{last}' out of range (len {len})")))?;
            let changed = !values_equal(slot, &value);
            if changed {
                *slot = value;
            }
            Ok(changed)
        }
        None => Ok(false),
    }
}

fn push_path(doc: &mut BsonDocument, path: &str, value: Bson) -> Result<bool, DbError> {
    let (parents, last) = split_leaf(path);
    let target = match parent_mut(doc, &parents, true)? {
        Some(Slot::Doc(d)) => {
            if matches!(d.get(last), None | Some(Bson::Null)) {
                d.insert(last.to_string(), Bson::Array(Vec::new()));
            }
            d.get_mut(last)
        }
        Some(Slot::Arr(a)) => last.parse::<usize>().ok().and_then(|i| a.get_mut(i)),
        None => None,
    };
    match target {
        Some(Bson::Array(items)) => {
            items.push(value);
            Ok(true)
        }
        Some(_) => Err(DbError::MalformedOperation(format!("$push target '{path}' is not an array"))),
        None => Ok(false),
    }
}

fn pull_path(doc: &mut BsonDocument, path: &str, matches: impl Fn(&Bson) -> bool) -> Result<bool, DbError> {
    let (parents, last) = split_leaf(path);
    let target = match parent_mut(doc, &parents, false)? {
        Some(Slot::Doc(d)) => d.get_mut(last),
        Some(Slot::Arr(a)) => last.parse::<usize>().ok().and_then(|i| a.get_mut(i)),
        None => None,
    };
    match target {
        Some(Bson::Array(items)) => {
            let before = items.len();
            items.retain(|e| !matches(e));
            Ok(items.len() != before)
        }
        Some(Bson::Null) | None => Ok(false),
        Some(_) => Err(DbError::MalformedOperation(format!("$pull target '{path}' is not an array"))),
    }
}
