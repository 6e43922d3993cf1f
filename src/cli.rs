use bson::{Bson, Document as BsonDocument};
use serde_json::json;

use crate::Store;
use crate::orders::{OrderRegistration, Progress, bid_candidate};
use crate::query::{self, FindOptions, Order, json_to_document};

/// Operator commands, independent of how they were parsed.
pub enum Command {
    /// Register an order from the template (idempotent).
    Seed { order_id: String, designer_id: Option<String>, product_id: Option<String>, fields_json: Option<String> },
    Show { order_id: String },
    Complete { order_id: String, step: i32, stage: Option<i32> },
    Repair { order_id: String },
    Bid { order_id: String, factory_id: String, name: String, contact: String, price: i64, expect_work_day: String },
    Accept { order_id: String, factory_id: String },
    Find { collection: String, filter_json: String, project: Option<String>, sort: Option<String>, limit: Option<usize>, skip: Option<usize> },
    Count { collection: String, filter_json: String },
    Update {
        collection: String,
        filter_json: String,
        update_json: String,
        upsert: bool,
        array_filters_json: Option<String>,
    },
    Indexes,
}

fn doc_json(doc: BsonDocument) -> serde_json::Value {
    Bson::Document(doc).into_relaxed_extjson()
}

/// `field` ascending, `-field` descending, comma separated.
fn sort_specs(s: &str) -> Vec<(String, Order)> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|part| match part.strip_prefix('-') {
            Some(rest) => (rest.to_string(), Order::Desc),
            None => (part.trim_start_matches('+').to_string(), Order::Asc),
        })
        .collect()
}

/// # Errors
/// Parse errors for JSON arguments and the errors of the underlying operation.
pub fn run(store: &Store, cmd: Command) -> Result<(), Box<dyn std::error::Error>> {
    let orders = store.orders();
    match cmd {
        Command::Seed { order_id, designer_id, product_id, fields_json } => {
            let fields = fields_json.as_deref().map(json_to_document).transpose()?.unwrap_or_default();
            let r = orders.register_order(&OrderRegistration { order_id: order_id.clone(), designer_id, product_id, fields })?;
            println!("{}", json!({ "order_id": order_id, "created": r.upserted, "failed": r.failed }));
        }
        Command::Show { order_id } => match orders.load(&order_id)? {
            Some(order) => println!("{}", serde_json::to_string_pretty(&order)?),
            None => return Err(format!("order {order_id} not found").into()),
        },
        Command::Complete { order_id, step, stage } => match orders.complete(&order_id, step, stage)? {
            Progress::Completed { current_step_index, step_done, order_done } => println!(
                "{}",
                json!({ "completed": true, "current_step_index": current_step_index, "step_done": step_done, "order_done": order_done })
            ),
            Progress::Rejected(reason) => {
                println!("{}", json!({ "completed": false, "reason": reason.to_string() }));
            }
        },
        Command::Repair { order_id } => match orders.repair(&order_id)? {
            Some(report) => println!(
                "{}",
                json!({
                    "restored_steps": report.restored_steps,
                    "repaired_stage_lists": report.repaired_stage_lists,
                    "normalised_steps": report.normalised_steps,
                })
            ),
            None => return Err(format!("order {order_id} not found").into()),
        },
        Command::Bid { order_id, factory_id, name, contact, price, expect_work_day } => {
            let r = orders.add_bid_candidate(&order_id, &bid_candidate(&factory_id, &name, &contact, price, &expect_work_day))?;
            println!("{}", json!({ "matched": r.matched, "modified": r.modified }));
        }
        Command::Accept { order_id, factory_id } => {
            let r = orders.accept_bid(&order_id, &factory_id)?;
            println!("{}", json!({ "accepted": r.matched > 0 }));
        }
        Command::Find { collection, filter_json, project, sort, limit, skip } => {
            let col = store.get_collection(&collection);
            let filter = query::parse_filter_json(&filter_json)?;
            let mut opts = FindOptions::default();
            if let Some(p) = project {
                opts.projection = Some(p.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect());
            }
            let mut cursor = col.find(&filter, &opts);
            for (field, order) in sort.as_deref().map(sort_specs).unwrap_or_default() {
                cursor = cursor.sort(field, order);
            }
            if let Some(n) = skip {
                cursor = cursor.skip(n);
            }
            if let Some(n) = limit {
                cursor = cursor.limit(n);
            }
            // NDJSON on stdout
            for doc in cursor {
                println!("{}", serde_json::to_string(&doc_json(doc))?);
            }
        }
        Command::Count { collection, filter_json } => {
            let n = store.get_collection(&collection).count_documents(&query::parse_filter_json(&filter_json)?);
            println!("{n}");
        }
        Command::Update { collection, filter_json, update_json, upsert, array_filters_json } => {
            let filter = query::parse_filter_json(&filter_json)?;
            let update = query::parse_update_json(&update_json)?;
            let array_filters =
                array_filters_json.as_deref().map(query::parse_array_filters_json).transpose()?.unwrap_or_default();
            let r = store.get_collection(&collection).update_one(&filter, &update, upsert, &array_filters)?;
            println!(
                "{}",
                json!({ "matched": r.matched, "modified": r.modified, "upserted": r.upserted, "failed": r.failed })
            );
        }
        Command::Indexes => {
            let n = store.ensure_indexes();
            println!("{}", json!({ "indexes": n }));
        }
    }
    Ok(())
}
