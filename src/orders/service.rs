use bson::{Bson, Document as BsonDocument, doc};
use serde_json::Value;

use super::model::{Order, to_bson};
use super::progress::{Progress, complete_current};
use super::repair::{RepairReport, load_repaired};
use super::template::steps_template_bson;
use crate::collection::Collection;
use crate::errors::DbError;
use crate::query::{ArrayFilter, ElemCondition, Filter, FindOptions, Order as SortOrder, UpdateDoc, UpdateReport};
use crate::timestamp::now_iso_minutes;

/// Fields an order registration may not set directly; they belong to the template or the state
/// machine.
const RESERVED_FIELDS: [&str; 6] =
    ["order_id", "steps", "current_step_index", "overall_status", "factory_id", "last_updated"];

/// Data for registering (or re-registering) an order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderRegistration {
    pub order_id: String,
    pub designer_id: Option<String>,
    pub product_id: Option<String>,
    /// Denormalised business fields copied from the external entities (`product_name`, `quantity`, ...).
    pub fields: BsonDocument,
}

fn opt_string(v: Option<&String>) -> Bson {
    v.map_or(Bson::Null, |s| Bson::String(s.clone()))
}

fn candidate_step_filter() -> Vec<ArrayFilter> {
    vec![ArrayFilter { name: "step".into(), condition: ElemCondition::Matches(Filter::eq("index", 1)) }]
}

const CANDIDATES_PATH: &str = "steps.$[step].factory_list";

/// Order workflows on top of one collection.
#[derive(Clone)]
pub struct OrderService {
    orders: Collection,
}

impl OrderService {
    #[must_use]
    pub const fn new(orders: Collection) -> Self {
        Self { orders }
    }

    #[must_use]
    pub const fn collection(&self) -> &Collection {
        &self.orders
    }

    /// Create the order from the template on first registration; later calls only refresh the
    /// back-references and denormalised fields, never progress.
    ///
    /// # Errors
    /// `MalformedOperation` when `fields` names a reserved field, plus the rejections of
    /// `Collection::update_one`.
    pub fn register_order(&self, reg: &OrderRegistration) -> Result<UpdateReport, DbError> {
        if let Some(k) = reg.fields.keys().find(|k| RESERVED_FIELDS.contains(&k.as_str()) || k.starts_with('$')) {
            return Err(DbError::MalformedOperation(format!("registration cannot set '{k}'")));
        }
        let mut update = UpdateDoc::new()
            .set_on_insert("current_step_index", 1)
            .set_on_insert("overall_status", "")
            .set_on_insert("factory_id", Bson::Null)
            .set_on_insert("steps", steps_template_bson())
            .set("designer_id", opt_string(reg.designer_id.as_ref()))
            .set("product_id", opt_string(reg.product_id.as_ref()));
        for (k, v) in &reg.fields {
            update = update.set(k.as_str(), v.clone());
        }
        update = update.set("last_updated", now_iso_minutes());
        let report = self.orders.update_one(&Filter::eq("order_id", reg.order_id.as_str()), &update, true, &[])?;
        if report.upserted {
            log::info!("order {} registered", reg.order_id);
        }
        Ok(report)
    }

    /// Add (or replace) a bid candidate on step 1, keyed by its `factory_id`.
    ///
    /// # Errors
    /// `MalformedOperation` when the candidate has no string `factory_id`.
    pub fn add_bid_candidate(&self, order_id: &str, candidate: &BsonDocument) -> Result<UpdateReport, DbError> {
        let Ok(factory_id) = candidate.get_str("factory_id") else {
            return Err(DbError::MalformedOperation("bid candidate needs a string factory_id".into()));
        };
        // $pull runs before $push, so a resubmitted bid replaces the old entry
        let update = UpdateDoc::new()
            .pull(CANDIDATES_PATH, ElemCondition::Matches(Filter::eq("factory_id", factory_id)))
            .push(CANDIDATES_PATH, candidate.clone())
            .set("last_updated", now_iso_minutes());
        self.orders.update_one(&Filter::eq("order_id", order_id), &update, false, &candidate_step_filter())
    }

    /// # Errors
    /// Rejections of `Collection::update_one`.
    pub fn withdraw_bid_candidate(&self, order_id: &str, factory_id: &str) -> Result<UpdateReport, DbError> {
        let update = UpdateDoc::new()
            .pull(CANDIDATES_PATH, ElemCondition::Matches(Filter::eq("factory_id", factory_id)))
            .set("last_updated", now_iso_minutes());
        self.orders.update_one(&Filter::eq("order_id", order_id), &update, false, &candidate_step_filter())
    }

    /// Accept a candidate: record the factory and copy its name, contact, price and due date onto the
    /// order. Only an order with no accepted factory matches.
    ///
    /// # Errors
    /// Decode errors for stored documents that are not orders, plus update rejections.
    pub fn accept_bid(&self, order_id: &str, factory_id: &str) -> Result<UpdateReport, DbError> {
        let Some(order) = self.load(order_id)? else {
            return Ok(UpdateReport::unmatched());
        };
        let candidate = order
            .step(1)
            .and_then(|s| s.factory_list().iter().find(|c| c.get("factory_id").and_then(Value::as_str) == Some(factory_id)))
            .cloned();
        let Some(Value::Object(candidate)) = candidate else {
            log::warn!("order {order_id}: no bid from factory {factory_id}");
            return Ok(UpdateReport::unmatched());
        };
        let field = |k: &str| candidate.get(k).map_or(Ok(Bson::Null), to_bson);
        let mut update = UpdateDoc::new()
            .set("factory_id", factory_id)
            .set("factory_name", field("name")?)
            .set("work_price", field("work_price")?)
            .set("due_date", field("expect_work_day")?);
        if let Some(pos) = order.step_position(2) {
            update = update
                .set(format!("steps.{pos}.factory_name"), field("name")?)
                .set(format!("steps.{pos}.factory_contact"), field("contact")?);
        }
        update = update.set("last_updated", now_iso_minutes());
        let guard = Filter::and(vec![
            Filter::eq("order_id", order_id),
            Filter::eq("factory_id", Bson::Null),
            Filter::eq("steps.factory_list.factory_id", factory_id),
        ]);
        let report = self.orders.update_one(&guard, &update, false, &[])?;
        if report.matched > 0 {
            log::info!("order {order_id}: bid from factory {factory_id} accepted");
        }
        Ok(report)
    }

    /// Read an order, repairing its step and stage lists first when they are damaged.
    ///
    /// # Errors
    /// Decode errors for stored documents that are not orders.
    pub fn load(&self, order_id: &str) -> Result<Option<Order>, DbError> {
        Ok(self.load_with_report(order_id)?.map(|(order, _)| order))
    }

    /// Run the repair routine on one order; `None` when the order does not exist.
    ///
    /// # Errors
    /// Decode errors, and `Unavailable` when the repaired steps could not be written back.
    pub fn repair(&self, order_id: &str) -> Result<Option<RepairReport>, DbError> {
        Ok(self.load_with_report(order_id)?.map(|(_, report)| report))
    }

    fn load_with_report(&self, order_id: &str) -> Result<Option<(Order, RepairReport)>, DbError> {
        Ok(load_repaired(&self.orders, order_id)?.map(|r| (r.order, r.report)))
    }

    /// Complete the current step, or `stage` within it, repairing the order first.
    ///
    /// # Errors
    /// See [`complete_current`].
    pub fn complete(&self, order_id: &str, step: i32, stage: Option<i32>) -> Result<Progress, DbError> {
        complete_current(&self.orders, order_id, step, stage)
    }

    /// Orders of one designer, most recently updated first.
    ///
    /// # Errors
    /// Decode errors for stored documents that are not orders.
    pub fn orders_for_designer(&self, designer_id: &str) -> Result<Vec<Order>, DbError> {
        self.list(&Filter::eq("designer_id", designer_id))
    }

    /// Orders a factory is involved in: accepted, or bidding on step 1.
    ///
    /// # Errors
    /// Decode errors for stored documents that are not orders.
    pub fn orders_for_factory(&self, factory_id: &str) -> Result<Vec<Order>, DbError> {
        self.list(&Filter::Or(vec![
            Filter::eq("factory_id", factory_id),
            Filter::eq("steps.factory_list.factory_id", factory_id),
        ]))
    }

    fn list(&self, filter: &Filter) -> Result<Vec<Order>, DbError> {
        self.orders
            .find(filter, &FindOptions::default())
            .sort("last_updated", SortOrder::Desc)
            .sort("order_id", SortOrder::Asc)
            .map(|d| Order::from_document(&d))
            .collect()
    }
}

/// A bid candidate entry in the shape the template's `factory_list` uses.
#[must_use]
pub fn bid_candidate(factory_id: &str, name: &str, contact: &str, work_price: i64, expect_work_day: &str) -> BsonDocument {
    doc! {
        "factory_id": factory_id,
        "profile_image": "",
        "name": name,
        "contact": contact,
        "address": "",
        "work_price": work_price,
        "currency": "KRW",
        "expect_work_day": expect_work_day,
    }
}
