use bson::{Bson, Document as BsonDocument};
use std::cmp::Ordering;

use super::types::{ElemCondition, Filter, MAX_PATH_DEPTH};

#[must_use]
pub fn eval_filter(doc: &BsonDocument, filter: &Filter) -> bool {
    match filter {
        Filter::True => true,
        Filter::And(fs) => fs.iter().all(|f| eval_filter(doc, f)),
        Filter::Or(fs) => fs.iter().any(|f| eval_filter(doc, f)),
        Filter::Eq { path, value } => path_matches(doc, path, &|v| leaf_equals(v, value), matches!(value, Bson::Null)),
        Filter::In { path, values } => {
            let accepts_missing = values.iter().any(|v| matches!(v, Bson::Null));
            path_matches(doc, path, &|v| values.iter().any(|x| leaf_equals(v, x)), accepts_missing)
        }
    }
}

/// Match a single array element against an element condition.
#[must_use]
pub fn elem_matches(elem: &Bson, cond: &ElemCondition) -> bool {
    match cond {
        ElemCondition::Value(v) => values_equal(elem, v),
        ElemCondition::Matches(f) => match elem {
            Bson::Document(d) => eval_filter(d, f),
            _ => false,
        },
    }
}

/// Walk `path` and report whether any reachable leaf satisfies `pred`.
///
/// A numeric segment applied to an array selects that position; any other segment fans out
/// over the array's elements. When nothing is reachable, `on_missing` is returned.
fn path_matches(doc: &BsonDocument, path: &str, pred: &dyn Fn(&Bson) -> bool, on_missing: bool) -> bool {
    if path.is_empty() {
        return false;
    }
    let segs: Vec<&str> = path.split('.').collect();
    if segs.len() > MAX_PATH_DEPTH {
        return false;
    }
    let mut reached = false;
    let hit = match doc.get(segs[0]) {
        Some(v) => walk(v, &segs[1..], pred, &mut reached),
        None => false,
    };
    hit || (!reached && on_missing)
}

fn walk(cur: &Bson, rest: &[&str], pred: &dyn Fn(&Bson) -> bool, reached: &mut bool) -> bool {
    let Some((seg, tail)) = rest.split_first() else {
        *reached = true;
        return pred(cur);
    };
    match cur {
        Bson::Document(d) => match d.get(*seg) {
            Some(v) => walk(v, tail, pred, reached),
            None => false,
        },
        Bson::Array(items) => {
            if let Ok(pos) = seg.parse::<usize>() {
                return items.get(pos).is_some_and(|v| walk(v, tail, pred, reached));
            }
            items.iter().any(|item| match item {
                Bson::Document(_) => walk(item, rest, pred, reached),
                _ => false,
            })
        }
        _ => false,
    }
}

/// Leaf equality: exact match, or membership when the leaf is an array and the operand is not.
fn leaf_equals(leaf: &Bson, expected: &Bson) -> bool {
    if values_equal(leaf, expected) {
        return true;
    }
    match (leaf, expected) {
        (Bson::Array(items), e) if !matches!(e, Bson::Array(_)) => items.iter().any(|x| values_equal(x, e)),
        _ => false,
    }
}

/// Structural equality that treats the numeric types as one value space.
#[allow(clippy::float_cmp, clippy::cast_precision_loss)]
#[must_use]
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (a, b) {
        (Bson::Int32(x), Bson::Int64(y)) => i64::from(*x) == *y,
        (Bson::Int64(x), Bson::Int32(y)) => *x == i64::from(*y),
        (Bson::Int32(x), Bson::Double(y)) => f64::from(*x) == *y,
        (Bson::Double(x), Bson::Int32(y)) => *x == f64::from(*y),
        (Bson::Int64(x), Bson::Double(y)) => (*x as f64) == *y,
        (Bson::Double(x), Bson::Int64(y)) => *x == (*y as f64),
        (Bson::Array(xs), Bson::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Bson::Document(x), Bson::Document(y)) => {
            x.len() == y.len()
                && x.iter().zip(y.iter()).all(|((ka, va), (kb, vb))| ka == kb && values_equal(va, vb))
        }
        _ => a == b,
    }
}

/// Read a plain dotted path (documents and numeric array positions only).
#[must_use]
pub fn get_path<'a>(doc: &'a BsonDocument, path: &str) -> Option<&'a Bson> {
    let mut segs = path.split('.');
    let mut cur = doc.get(segs.next()?)?;
    for seg in segs {
        cur = match cur {
            Bson::Document(d) => d.get(seg)?,
            Bson::Array(items) => items.get(seg.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(cur)
}

#[allow(clippy::cast_precision_loss)]
pub fn compare_bson(a: &Bson, b: &Bson) -> Ordering {
    use bson::Bson as T;
    fn as_num(x: &T) -> Option<f64> {
        match x {
            T::Int32(i) => Some(f64::from(*i)),
            T::Int64(i) => Some(*i as f64),
            T::Double(f) => Some(*f),
            _ => None,
        }
    }
    if let (Some(x), Some(y)) = (as_num(a), as_num(b)) {
        return x.total_cmp(&y);
    }
    match (a, b) {
        (T::String(x), T::String(y)) => x.cmp(y),
        (T::Boolean(x), T::Boolean(y)) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn type_rank(v: &Bson) -> u8 {
    use bson::Bson as T;
    match v {
        T::Null | T::Undefined => 0,
        T::Int32(_) | T::Int64(_) | T::Double(_) | T::Decimal128(_) => 1,
        T::String(_) | T::Symbol(_) => 2,
        T::Document(_) => 3,
        T::Array(_) => 4,
        T::Binary(_) => 5,
        T::ObjectId(_) => 6,
        T::Boolean(_) => 7,
        T::DateTime(_) => 8,
        T::Timestamp(_) => 9,
        T::RegularExpression(_) => 10,
        _ => 11,
    }
}

#[must_use]
pub fn project_fields(doc: &BsonDocument, fields: &[String]) -> BsonDocument {
    let mut out = BsonDocument::new();
    for f in fields {
        if let Some(v) = doc.get(f) {
            out.insert(f.clone(), v.clone());
        }
    }
    out
}
