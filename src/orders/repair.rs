use bson::{Bson, Document as BsonDocument};

use super::model::{Order, Stage, Step, from_document, to_bson};
use super::template::{stage_template, steps_template};
use crate::collection::Collection;
use crate::errors::DbError;
use crate::query::{Filter, UpdateDoc};

/// Progress fields every stored step and stage carries, even while pending.
const PROGRESS_KEYS: [&str; 2] = ["status", "end_date"];

/// Merge a stored stage list against the template by `index`.
///
/// Stored entries win for `status`, `end_date` and any extra fields; template entries fill the gaps.
/// Stored stages the template does not know are kept, ordered by index after the known ones.
#[must_use]
pub fn merge_stages(existing: &[Stage], template: &[Stage]) -> Vec<Stage> {
    let mut out: Vec<Stage> = template
        .iter()
        .map(|t| match existing.iter().find(|e| e.index == t.index) {
            Some(e) => {
                let mut merged = e.clone();
                if merged.name.is_empty() {
                    merged.name.clone_from(&t.name);
                }
                for (k, v) in &t.extra {
                    merged.extra.entry(k.clone()).or_insert_with(|| v.clone());
                }
                merged
            }
            None => t.clone(),
        })
        .collect();
    let mut unknown: Vec<Stage> =
        existing.iter().filter(|e| !template.iter().any(|t| t.index == e.index)).cloned().collect();
    unknown.sort_by_key(|s| s.index);
    out.extend(unknown);
    out
}

fn template_stages(step_index: i32) -> Result<Option<Vec<Stage>>, DbError> {
    stage_template(step_index).map(|docs| docs.iter().map(from_document).collect()).transpose()
}

/// What `repair_order` changed, by step index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub restored_steps: Vec<i32>,
    pub repaired_stage_lists: Vec<i32>,
    /// Steps stored without `status`/`end_date` on themselves or one of their stages.
    pub normalised_steps: Vec<i32>,
}

impl RepairReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.restored_steps.is_empty() && self.repaired_stage_lists.is_empty() && self.normalised_steps.is_empty()
    }
}

/// Restore missing steps and truncated or missing stage lists in place.
///
/// Completed data is never dropped, and a second run on the result reports nothing.
///
/// # Errors
/// Only fails if the built-in template cannot be decoded.
pub fn repair_order(order: &mut Order) -> Result<RepairReport, DbError> {
    let mut report = RepairReport::default();
    let template: Vec<Step> = steps_template().iter().map(from_document).collect::<Result<_, _>>()?;
    for t in &template {
        if order.step(t.index).is_none() {
            log::warn!("order {}: step {} missing, restored from template", order.order_id, t.index);
            order.steps.push(t.clone());
            report.restored_steps.push(t.index);
        }
    }
    if !report.restored_steps.is_empty() {
        order.steps.sort_by_key(|s| s.index);
    }
    for step in &mut order.steps {
        let Some(tmpl) = template_stages(step.index)? else {
            continue;
        };
        let current = step.stage.clone().unwrap_or_default();
        let merged = merge_stages(&current, &tmpl);
        if step.stage.as_ref() != Some(&merged) {
            log::info!(
                "order {}: step {} stage list repaired ({} -> {} stages)",
                order.order_id,
                step.index,
                current.len(),
                merged.len()
            );
            step.stage = Some(merged);
            report.repaired_stage_lists.push(step.index);
        }
    }
    Ok(report)
}

fn lacks_progress_keys(d: &BsonDocument) -> bool {
    PROGRESS_KEYS.iter().any(|k| matches!(d.get(*k), None | Some(Bson::Null)))
}

fn step_index(step: &BsonDocument) -> Option<i32> {
    match step.get("index")? {
        Bson::Int32(i) => Some(*i),
        Bson::Int64(i) => i32::try_from(*i).ok(),
        _ => None,
    }
}

fn steps_missing_progress_keys(doc: &BsonDocument) -> Vec<i32> {
    let Ok(steps) = doc.get_array("steps") else {
        return Vec::new();
    };
    steps
        .iter()
        .filter_map(Bson::as_document)
        .filter(|step| {
            lacks_progress_keys(step)
                || step.get_array("stage").is_ok_and(|st| st.iter().filter_map(Bson::as_document).any(lacks_progress_keys))
        })
        .filter_map(step_index)
        .collect()
}

/// Decode a stored order and repair it.
///
/// Besides what [`repair_order`] fixes on the typed view, the report names steps whose stored form
/// lacks progress fields, so that writing the repaired steps back gives them their canonical shape.
///
/// # Errors
/// Decode errors for documents that are not orders.
pub fn repair_document(doc: &BsonDocument) -> Result<(Order, RepairReport), DbError> {
    let mut order = Order::from_document(doc)?;
    let mut report = repair_order(&mut order)?;
    report.normalised_steps = steps_missing_progress_keys(doc);
    if !report.normalised_steps.is_empty() {
        log::info!("order {}: progress fields filled in on steps {:?}", order.order_id, report.normalised_steps);
    }
    Ok((order, report))
}

/// An order read with [`load_repaired`].
#[derive(Debug, Clone, PartialEq)]
pub struct Repaired {
    pub order: Order,
    pub report: RepairReport,
    /// The stored steps now equal `order.steps`. False when another writer changed them between
    /// the read and the repair write.
    pub persisted: bool,
}

/// The write storing `repaired` over `read`: only when the stored steps are still exactly as read.
///
/// # Errors
/// Returns an error if the steps cannot be represented as BSON.
pub fn repair_write(read: &BsonDocument, repaired: &Order) -> Result<(Filter, UpdateDoc), DbError> {
    let guard = Filter::and(vec![
        Filter::eq("order_id", repaired.order_id.as_str()),
        Filter::eq("steps", read.get("steps").cloned().unwrap_or(Bson::Null)),
    ]);
    Ok((guard, UpdateDoc::new().set("steps", to_bson(&repaired.steps)?)))
}

/// Read `order_id` and write its repaired steps back, guarded on the exact steps that were read.
///
/// # Errors
/// Decode errors, and `Unavailable` when the store could not take the repair write.
pub fn load_repaired(orders: &Collection, order_id: &str) -> Result<Option<Repaired>, DbError> {
    let Some(doc) = orders.find_one(&Filter::eq("order_id", order_id)) else {
        return Ok(None);
    };
    let (order, report) = repair_document(&doc)?;
    if report.is_empty() {
        return Ok(Some(Repaired { order, report, persisted: true }));
    }
    let (guard, update) = repair_write(&doc, &order)?;
    let written = orders.update_one(&guard, &update, false, &[])?;
    if written.failed {
        return Err(DbError::Unavailable(format!("order {order_id}: repaired steps not persisted")));
    }
    let persisted = written.matched > 0;
    if persisted {
        log::info!("order {order_id}: repair persisted");
    } else {
        log::warn!("order {order_id}: steps changed while repairing; repair not written");
    }
    Ok(Some(Repaired { order, report, persisted }))
}
