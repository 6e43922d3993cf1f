//! Translation of filters into the table store's scan filter expressions.
//!
//! The table store only understands top-level attribute predicates, so the translation keeps the
//! parts of a filter it can express exactly or as a superset and drops the rest; the in-memory
//! predicate is always applied to whatever the scan returns.

use bson::{Bson, Document as BsonDocument};
use std::collections::BTreeMap;

use super::eval::values_equal;
use super::types::Filter;

/// Condition tree over placeholder names (`#n0`) and values (`:v0`).
#[derive(Debug, Clone, PartialEq)]
pub enum Cond {
    Eq { name: String, value: String },
    Contains { name: String, value: String },
    NotExists { name: String },
    And(Vec<Cond>),
    Or(Vec<Cond>),
}

/// Parameterised filter expression; attribute names and values are never inlined.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterExpression {
    pub condition: Option<Cond>,
    pub names: BTreeMap<String, String>,
    pub values: BTreeMap<String, Bson>,
}

impl FilterExpression {
    /// Render the textual form, e.g. `(#n0 = :v0 OR contains(#n0, :v0)) AND (#n1 = :v1 OR ...)`.
    #[must_use]
    pub fn expression(&self) -> String {
        self.condition.as_ref().map(render).unwrap_or_default()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.condition.is_none()
    }

    /// Evaluate the expression against a stored item the way the table store does.
    /// An empty expression accepts everything.
    #[must_use]
    pub fn matches(&self, item: &BsonDocument) -> bool {
        self.condition.as_ref().is_none_or(|c| self.eval(c, item))
    }

    fn eval(&self, c: &Cond, item: &BsonDocument) -> bool {
        let attr = |name: &String| self.names.get(name).and_then(|a| item.get(a));
        let value = |p: &String| self.values.get(p);
        match c {
            Cond::Eq { name, value: v } => match (attr(name), value(v)) {
                (Some(a), Some(b)) => values_equal(a, b),
                _ => false,
            },
            Cond::Contains { name, value: v } => match (attr(name), value(v)) {
                (Some(Bson::Array(items)), Some(b)) => items.iter().any(|x| values_equal(x, b)),
                (Some(Bson::String(s)), Some(Bson::String(sub))) => s.contains(sub.as_str()),
                _ => false,
            },
            Cond::NotExists { name } => attr(name).is_none(),
            Cond::And(parts) => parts.iter().all(|p| self.eval(p, item)),
            Cond::Or(parts) => parts.iter().any(|p| self.eval(p, item)),
        }
    }
}

fn render(c: &Cond) -> String {
    match c {
        Cond::Eq { name, value } => format!("{name} = {value}"),
        Cond::Contains { name, value } => format!("contains({name}, {value})"),
        Cond::NotExists { name } => format!("attribute_not_exists({name})"),
        Cond::And(parts) => parts.iter().map(render_nested).collect::<Vec<_>>().join(" AND "),
        Cond::Or(parts) => format!("({})", parts.iter().map(render_nested).collect::<Vec<_>>().join(" OR ")),
    }
}

fn render_nested(c: &Cond) -> String {
    match c {
        Cond::And(_) => format!("({})", render(c)),
        _ => render(c),
    }
}

struct Builder {
    names: BTreeMap<String, String>,
    by_attr: BTreeMap<String, String>,
    values: BTreeMap<String, Bson>,
}

impl Builder {
    fn name(&mut self, attr: &str) -> String {
        if let Some(n) = self.by_attr.get(attr) {
            return n.clone();
        }
        let n = format!("#n{}", self.names.len());
        self.names.insert(n.clone(), attr.to_string());
        self.by_attr.insert(attr.to_string(), n.clone());
        n
    }

    fn value(&mut self, v: &Bson) -> String {
        let p = format!(":v{}", self.values.len());
        self.values.insert(p.clone(), v.clone());
        p
    }

    /// Superset-safe translation; `None` means "cannot narrow the scan".
    fn translate(&mut self, f: &Filter) -> Option<Cond> {
        match f {
            Filter::True => None,
            Filter::Eq { path, .. } | Filter::In { path, .. } if path.contains('.') => None,
            Filter::Eq { path, value } => Some(self.equality(path, value)),
            Filter::In { path, values } => {
                if values.is_empty() {
                    return None;
                }
                Some(Cond::Or(values.iter().map(|v| self.equality(path, v)).collect()))
            }
            Filter::And(parts) => {
                let kept: Vec<Cond> = parts.iter().filter_map(|p| self.translate(p)).collect();
                match kept.len() {
                    0 => None,
                    1 => kept.into_iter().next(),
                    _ => Some(Cond::And(kept)),
                }
            }
            Filter::Or(alts) => {
                let mut out = Vec::with_capacity(alts.len());
                for a in alts {
                    // one unconstrained branch makes the whole disjunction unconstrained
                    out.push(self.translate(a)?);
                }
                if out.is_empty() { None } else { Some(Cond::Or(out)) }
            }
        }
    }

    /// Equality that also admits array attributes containing the value, and missing attributes
    /// for `null`.
    fn equality(&mut self, path: &str, value: &Bson) -> Cond {
        let name = self.name(path);
        let v = self.value(value);
        let mut alts = Vec::with_capacity(3);
        if matches!(value, Bson::Null) {
            alts.push(Cond::NotExists { name: name.clone() });
        }
        alts.push(Cond::Eq { name: name.clone(), value: v.clone() });
        alts.push(Cond::Contains { name, value: v });
        Cond::Or(alts)
    }
}

/// Build the scan pushdown for `filter`.
#[must_use]
pub fn to_filter_expression(filter: &Filter) -> FilterExpression {
    let mut b = Builder { names: BTreeMap::new(), by_attr: BTreeMap::new(), values: BTreeMap::new() };
    let condition = b.translate(filter);
    if condition.is_none() {
        return FilterExpression::default();
    }
    FilterExpression { condition, names: b.names, values: b.values }
}
