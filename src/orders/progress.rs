//! Order progress state machine.
//!
//! Every transition is one guarded `update_one`: the filter pins the current step index and the
//! pending completion date of the unit being completed, so a concurrent writer that got there
//! first turns the write into a zero match instead of a double completion.

use bson::Bson;
use thiserror::Error;

use super::ORDER_DONE;
use super::model::{Order, Step};
use super::repair::{Repaired, load_repaired};
use crate::collection::Collection;
use crate::errors::DbError;
use crate::query::{Filter, UpdateDoc};
use crate::timestamp::{now_iso_minutes, today};

pub const STATUS_ACTIVE: &str = "active";
pub const STATUS_DONE: &str = "done";

/// Why a completion request was refused. Nothing is written in any of these cases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("order not found")]
    OrderNotFound,
    #[error("step is not current (current step is {current})")]
    StaleStep { current: i32 },
    #[error("step has no stages")]
    NotStageBearing,
    #[error("stages complete in order; next expected stage is {expected}")]
    StageOutOfOrder { expected: i32 },
    #[error("step still has pending stages; next is {next_stage}")]
    StagesIncomplete { next_stage: i32 },
    #[error("already completed")]
    AlreadyCompleted,
    #[error("order changed concurrently; re-read and retry")]
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    Completed { current_step_index: i32, step_done: bool, order_done: bool },
    Rejected(Rejection),
}

/// The write a valid request turns into.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub guard: Filter,
    pub update: UpdateDoc,
    pub outcome: Progress,
}

/// Decide the transition for completing `step` (or its `stage`) on `order`.
///
/// # Errors
/// Returns `DbError::MalformedOperation` when `step` or `stage` is outside the order's layout.
pub fn plan(order: &Order, step: i32, stage: Option<i32>) -> Result<Result<Transition, Rejection>, DbError> {
    let last_step = order.steps.iter().map(|s| s.index).max().unwrap_or(0);
    let Some(pos) = order.step_position(step).filter(|_| step >= 1) else {
        return Err(DbError::MalformedOperation(format!("step {step} is outside 1..={last_step}")));
    };
    let target = &order.steps[pos];
    if let Some(k) = stage
        && let Some(stages) = &target.stage
        && !stages.iter().any(|s| s.index == k)
    {
        return Err(DbError::MalformedOperation(format!("stage {k} does not exist on step {step}")));
    }
    if step != order.current_step_index {
        return Ok(Err(Rejection::StaleStep { current: order.current_step_index }));
    }
    if target.is_done() {
        return Ok(Err(Rejection::AlreadyCompleted));
    }

    let date = today();
    let step_path = format!("steps.{pos}");
    let mut guard = vec![
        Filter::eq("order_id", order.order_id.as_str()),
        Filter::eq("current_step_index", step),
        pending(format!("{step_path}.end_date")),
    ];
    let mut update = UpdateDoc::new();
    let step_done = match stage {
        Some(k) => {
            let Some(stages) = target.stage.as_ref().filter(|s| !s.is_empty()) else {
                return Ok(Err(Rejection::NotStageBearing));
            };
            let Some(next) = target.next_pending_stage() else {
                return Ok(Err(Rejection::AlreadyCompleted));
            };
            if next.index != k {
                return Ok(Err(Rejection::StageOutOfOrder { expected: next.index }));
            }
            let Some(stage_pos) = stages.iter().position(|s| s.index == k) else {
                return Err(DbError::MalformedOperation(format!("stage {k} does not exist on step {step}")));
            };
            let stage_path = format!("{step_path}.stage.{stage_pos}");
            guard.push(pending(format!("{stage_path}.end_date")));
            update = update.set(format!("{stage_path}.end_date"), date.as_str()).set(format!("{stage_path}.status"), STATUS_DONE);
            let remaining = stages.iter().filter(|s| !s.is_done() && s.index != k).count();
            remaining == 0
        }
        None => {
            if let Some(next) = target.next_pending_stage() {
                return Ok(Err(Rejection::StagesIncomplete { next_stage: next.index }));
            }
            true
        }
    };

    let mut current = step;
    let mut order_done = false;
    if step_done {
        update = update.set(format!("{step_path}.end_date"), date.as_str()).set(format!("{step_path}.status"), STATUS_DONE);
        match next_step(order, pos) {
            Some((next_pos, next)) => {
                current = next.index;
                update = update
                    .set("current_step_index", current)
                    .set(format!("steps.{next_pos}.status"), STATUS_ACTIVE);
            }
            None => {
                order_done = true;
                update = update.set("overall_status", ORDER_DONE);
            }
        }
    } else {
        update = update.set(format!("{step_path}.status"), STATUS_ACTIVE);
    }
    update = update.set("last_updated", now_iso_minutes());
    Ok(Ok(Transition {
        guard: Filter::and(guard),
        update,
        outcome: Progress::Completed { current_step_index: current, step_done, order_done },
    }))
}

/// No completion date yet: empty, null or absent.
fn pending(path: String) -> Filter {
    Filter::In { path, values: vec![Bson::String(String::new()), Bson::Null] }
}

fn next_step(order: &Order, pos: usize) -> Option<(usize, &Step)> {
    order.steps.iter().enumerate().nth(pos + 1)
}

/// Complete the current unit of `order_id`: the step itself, or `stage` within it.
///
/// The order is repaired (and the repair written back) before planning, so a damaged stage list
/// can never let a step finish early.
///
/// # Errors
/// `MalformedOperation` for out-of-range indices, `Unavailable` when the store could not take
/// the write, and decode errors for documents that are not orders.
pub fn complete_current(
    orders: &Collection,
    order_id: &str,
    step: i32,
    stage: Option<i32>,
) -> Result<Progress, DbError> {
    let Some(Repaired { order, persisted, .. }) = load_repaired(orders, order_id)? else {
        return Ok(Progress::Rejected(Rejection::OrderNotFound));
    };
    if !persisted {
        // positions in the plan would not match what is stored
        return Ok(Progress::Rejected(Rejection::Conflict));
    }
    let transition = match plan(&order, step, stage)? {
        Ok(t) => t,
        Err(rejection) => {
            log::info!("order {order_id}: completion of step {step} stage {stage:?} rejected: {rejection}");
            return Ok(Progress::Rejected(rejection));
        }
    };
    let report = orders.update_one(&transition.guard, &transition.update, false, &[])?;
    if report.failed {
        return Err(DbError::Unavailable(format!("order {order_id}: progress write did not reach the store")));
    }
    if report.matched == 0 {
        log::warn!("order {order_id}: completion of step {step} lost to a concurrent update");
        return Ok(Progress::Rejected(Rejection::Conflict));
    }
    log::info!("order {order_id}: step {step} stage {stage:?} completed -> {:?}", transition.outcome);
    Ok(transition.outcome)
}
