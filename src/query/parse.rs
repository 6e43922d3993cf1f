use bson::{Bson, Document as BsonDocument};

use super::types::{ArrayFilter, ElemCondition, Filter, MAX_IN_SET, MAX_UPDATE_PATHS, UpdateDoc, UpdateOp};
use crate::errors::DbError;

/// Parse a Mongo-style filter document.
///
/// Accepted vocabulary: `{field: value}`, `{a.b.c: value}`, `{"$or": [filter, ...]}` and
/// `{field: {"$in": [values]}}`. Sibling constraints are ANDed with the `$or` group.
///
/// # Errors
/// Returns `DbError::QueryError` for unsupported operators or malformed operands.
pub fn parse_filter(doc: &BsonDocument) -> Result<Filter, DbError> {
    let mut parts = Vec::with_capacity(doc.len());
    for (key, val) in doc {
        if key == "$or" {
            let Bson::Array(alts) = val else {
                return Err(DbError::QueryError("$or expects an array of filters".into()));
            };
            let mut branches = Vec::with_capacity(alts.len());
            for alt in alts {
                let Bson::Document(d) = alt else {
                    return Err(DbError::QueryError("$or entries must be documents".into()));
                };
                branches.push(parse_filter(d)?);
            }
            parts.push(Filter::Or(branches));
        } else if key.starts_with('$') {
            return Err(DbError::QueryError(format!("unsupported filter operator: {key}")));
        } else {
            parts.push(parse_field(key, val)?);
        }
    }
    Ok(Filter::and(parts))
}

fn parse_field(path: &str, val: &Bson) -> Result<Filter, DbError> {
    if let Bson::Document(d) = val
        && d.keys().next().is_some_and(|k| k.starts_with('$'))
    {
        if d.len() != 1 {
            return Err(DbError::QueryError(format!("only a single operator is supported on '{path}'")));
        }
        return match d.get("$in") {
            Some(Bson::Array(values)) if values.len() > MAX_IN_SET => Err(DbError::QueryError(format!(
                "$in on '{path}' has {} values; at most {MAX_IN_SET} are allowed",
                values.len()
            ))),
            Some(Bson::Array(values)) => Ok(Filter::In { path: path.to_string(), values: values.clone() }),
            Some(_) => Err(DbError::QueryError(format!("$in on '{path}' expects an array"))),
            None => Err(DbError::QueryError(format!(
                "unsupported operator on '{path}': {}",
                d.keys().next().map_or("", String::as_str)
            ))),
        };
    }
    Ok(Filter::Eq { path: path.to_string(), value: val.clone() })
}

/// Parse a `$pull` sub-condition: documents reuse the filter rules, scalars match by value.
///
/// # Errors
/// Propagates filter parse errors.
pub fn parse_elem_condition(val: &Bson) -> Result<ElemCondition, DbError> {
    match val {
        Bson::Document(d) => Ok(ElemCondition::Matches(parse_filter(d)?)),
        other => Ok(ElemCondition::Value(other.clone())),
    }
}

/// Parse a Mongo-style update document.
///
/// # Errors
/// Returns `DbError::MalformedOperation` for unknown operators or non-document operands.
pub fn parse_update(doc: &BsonDocument) -> Result<UpdateDoc, DbError> {
    let mut out = UpdateDoc::new();
    for (op, fields) in doc {
        let Bson::Document(fields) = fields else {
            return Err(DbError::MalformedOperation(format!("{op} expects a document")));
        };
        if out.ops.len() + fields.len() > MAX_UPDATE_PATHS {
            return Err(DbError::MalformedOperation(format!(
                "too many update paths: more than {MAX_UPDATE_PATHS}"
            )));
        }
        for (path, val) in fields {
            let path = path.clone();
            let parsed = match op.as_str() {
                "$set" => UpdateOp::Set { path, value: val.clone() },
                "$setOnInsert" => UpdateOp::SetOnInsert { path, value: val.clone() },
                "$pull" => UpdateOp::Pull { path, condition: parse_elem_condition(val)? },
                "$push" => UpdateOp::Push { path, value: val.clone() },
                other => {
                    return Err(DbError::MalformedOperation(format!("unsupported update operator: {other}")));
                }
            };
            out.ops.push(parsed);
        }
    }
    Ok(out)
}

/// Parse one array-filter entry.
///
/// Both `{"name.field": value, ...}` and `{"name": {"field": value}}` are accepted; a scalar
/// `{"name": value}` compares the element itself.
///
/// # Errors
/// Returns `DbError::MalformedOperation` when the entry is empty or mixes placeholder names.
pub fn parse_array_filter(doc: &BsonDocument) -> Result<ArrayFilter, DbError> {
    let mut name: Option<String> = None;
    let mut whole: Option<ElemCondition> = None;
    let mut fields = BsonDocument::new();
    for (key, val) in doc {
        let (head, rest) = match key.split_once('.') {
            Some((h, r)) => (h, Some(r)),
            None => (key.as_str(), None),
        };
        if let Some(n) = &name
            && n != head
        {
            return Err(DbError::MalformedOperation(format!(
                "array filter mixes placeholder names '{n}' and '{head}'"
            )));
        }
        name = Some(head.to_string());
        match rest {
            Some(field) => {
                fields.insert(field.to_string(), val.clone());
            }
            None => whole = Some(parse_elem_condition(val)?),
        }
    }
    let Some(name) = name else {
        return Err(DbError::MalformedOperation("empty array filter".into()));
    };
    let condition = match (whole, fields.is_empty()) {
        (Some(c), true) => c,
        (None, false) => ElemCondition::Matches(parse_filter(&fields)?),
        (Some(ElemCondition::Matches(f)), false) => {
            ElemCondition::Matches(Filter::and(vec![f, parse_filter(&fields)?]))
        }
        (Some(ElemCondition::Value(_)), false) => {
            return Err(DbError::MalformedOperation(format!(
                "array filter '{name}' mixes element and field conditions"
            )));
        }
        (None, true) => {
            return Err(DbError::MalformedOperation(format!("array filter '{name}' has no condition")));
        }
    };
    Ok(ArrayFilter { name, condition })
}

/// # Errors
/// Propagates per-entry parse errors.
pub fn parse_array_filters(docs: &[BsonDocument]) -> Result<Vec<ArrayFilter>, DbError> {
    docs.iter().map(parse_array_filter).collect()
}

/// Parse a JSON object into a BSON document.
///
/// # Errors
/// Returns an error when the JSON is invalid or not a top-level object.
pub fn json_to_document(json: &str) -> Result<BsonDocument, DbError> {
    let val: serde_json::Value = serde_json::from_str(json)?;
    match val {
        serde_json::Value::Object(map) => {
            BsonDocument::try_from(map).map_err(|e| DbError::Decode(e.to_string()))
        }
        _ => Err(DbError::QueryError("expected a JSON object".into())),
    }
}

/// # Errors
/// Returns an error if the JSON string cannot be parsed into a filter.
pub fn parse_filter_json(json: &str) -> Result<Filter, DbError> {
    parse_filter(&json_to_document(json)?)
}

/// # Errors
/// Returns an error if the JSON string cannot be parsed into an update.
pub fn parse_update_json(json: &str) -> Result<UpdateDoc, DbError> {
    parse_update(&json_to_document(json)?)
}

/// Parse a JSON array of array-filter objects, e.g. `[{"step.index": 1}]`.
///
/// # Errors
/// Returns an error when the JSON is invalid, not an array of objects, or an entry is malformed.
pub fn parse_array_filters_json(json: &str) -> Result<Vec<ArrayFilter>, DbError> {
    let val: serde_json::Value = serde_json::from_str(json)?;
    let serde_json::Value::Array(entries) = val else {
        return Err(DbError::QueryError("array filters must be a JSON array".into()));
    };
    let docs = entries
        .into_iter()
        .map(|e| match e {
            serde_json::Value::Object(map) => BsonDocument::try_from(map).map_err(|e| DbError::Decode(e.to_string())),
            _ => Err(DbError::QueryError("array filter entries must be objects".into())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    parse_array_filters(&docs)
}
