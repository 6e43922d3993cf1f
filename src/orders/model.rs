use bson::{Bson, Document as BsonDocument};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::errors::DbError;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    pub index: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub end_date: String,
    /// Fields outside the progress model (e.g. `delivery_code`), carried through unchanged.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Stage {
    #[must_use]
    pub fn is_done(&self) -> bool {
        !self.end_date.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: i32,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub status: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub end_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<Vec<Stage>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Step {
    #[must_use]
    pub fn is_done(&self) -> bool {
        !self.end_date.is_empty()
    }

    /// Lowest-indexed stage still pending.
    #[must_use]
    pub fn next_pending_stage(&self) -> Option<&Stage> {
        self.stage.as_ref()?.iter().filter(|s| !s.is_done()).min_by_key(|s| s.index)
    }

    /// Candidate bids (step 1 only).
    #[must_use]
    pub fn factory_list(&self) -> &[Value] {
        match self.extra.get("factory_list") {
            Some(Value::Array(items)) => items,
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub order_id: String,
    #[serde(default = "first_step")]
    pub current_step_index: i32,
    #[serde(default)]
    pub overall_status: String,
    #[serde(default)]
    pub steps: Vec<Step>,
    #[serde(default)]
    pub designer_id: Option<String>,
    #[serde(default)]
    pub factory_id: Option<String>,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    /// Denormalised business fields (`product_name`, `quantity`, `due_date`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Stored `null` reads as the empty (pending) value.
fn null_as_empty<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(d)?.unwrap_or_default())
}

const fn first_step() -> i32 {
    1
}

impl Order {
    /// # Errors
    /// Returns `DbError::Json` when the document does not have the order shape.
    pub fn from_document(doc: &BsonDocument) -> Result<Self, DbError> {
        from_document(doc)
    }

    /// # Errors
    /// Returns an error if the order cannot be represented as a document.
    pub fn to_document(&self) -> Result<BsonDocument, DbError> {
        to_document(self)
    }

    #[must_use]
    pub fn step(&self, index: i32) -> Option<&Step> {
        self.steps.iter().find(|s| s.index == index)
    }

    /// Zero-based array position of step `index`.
    #[must_use]
    pub fn step_position(&self, index: i32) -> Option<usize> {
        self.steps.iter().position(|s| s.index == index)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.overall_status == super::ORDER_DONE
    }
}

/// Decode through relaxed extended JSON so numeric width in storage does not matter.
pub(crate) fn from_document<T: DeserializeOwned>(doc: &BsonDocument) -> Result<T, DbError> {
    Ok(serde_json::from_value(Bson::Document(doc.clone()).into_relaxed_extjson())?)
}

pub(crate) fn to_document<T: Serialize>(value: &T) -> Result<BsonDocument, DbError> {
    match serde_json::to_value(value)? {
        Value::Object(map) => BsonDocument::try_from(map).map_err(|e| DbError::Decode(e.to_string())),
        _ => Err(DbError::Decode("expected an object".into())),
    }
}

/// Convert a serialisable value into a BSON value.
pub(crate) fn to_bson<T: Serialize>(value: &T) -> Result<Bson, DbError> {
    Bson::try_from(serde_json::to_value(value)?).map_err(|e| DbError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::template::seed_order_document;

    #[test]
    fn typed_view_of_seeded_order() {
        let o = Order::from_document(&seed_order_document("o-1")).unwrap();
        assert_eq!(o.current_step_index, 1);
        assert_eq!(o.steps.len(), 7);
        assert!(o.step(1).unwrap().stage.is_none());
        assert_eq!(o.step(2).unwrap().next_pending_stage().unwrap().index, 1);
        assert!(o.designer_id.is_none());
        assert!(o.step(1).unwrap().factory_list().is_empty());
    }

    #[test]
    fn unknown_fields_survive_the_round_trip() {
        let mut d = seed_order_document("o-1");
        d.insert("product_name", "coat");
        let o = Order::from_document(&d).unwrap();
        let back = o.to_document().unwrap();
        assert_eq!(back.get_str("product_name").unwrap(), "coat");
        let step2 = &back.get_array("steps").unwrap()[1];
        let Bson::Document(step2) = step2 else { panic!("step is a document") };
        assert_eq!(step2.get_str("factory_contact").unwrap(), "");
        assert_eq!(step2.get_array("stage").unwrap().len(), 6);
    }

    #[test]
    fn null_and_missing_progress_fields_read_as_pending() {
        let d = bson::doc! {
            "order_id": "o-1",
            "steps": [ { "index": 1, "name": "Sample factory selection" }, { "index": 2, "status": Bson::Null, "end_date": Bson::Null } ],
        };
        let o = Order::from_document(&d).unwrap();
        assert!(o.steps.iter().all(|s| !s.is_done() && s.status.is_empty()));
    }
}
