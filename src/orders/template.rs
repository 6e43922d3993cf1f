//! Canonical order layout: seven steps in fixed order, steps 2 and 6 carrying six stages each.

use bson::{Bson, Document as BsonDocument, doc};

use crate::timestamp::now_iso_minutes;

pub const STEP_COUNT: i32 = 7;
pub const STAGE_BEARING_STEPS: [i32; 2] = [2, 6];

const STAGE_NAMES: [&str; 6] =
    ["First fitting", "Trim attachment", "Marking and cutting", "Sewing", "Inspection and pressing", "Delivery"];

#[must_use]
pub fn is_stage_bearing(step_index: i32) -> bool {
    STAGE_BEARING_STEPS.contains(&step_index)
}

/// Fresh stage list for a stage-bearing step; `None` for leaf steps.
#[must_use]
pub fn stage_template(step_index: i32) -> Option<Vec<BsonDocument>> {
    if !is_stage_bearing(step_index) {
        return None;
    }
    let stages = STAGE_NAMES
        .iter()
        .zip(1_i32..)
        .map(|(name, index)| {
            let mut s = doc! { "index": index, "name": *name, "status": "", "end_date": "" };
            // sample delivery carries its tracking code on the stage itself
            if step_index == 2 && index == 6 {
                s.insert("delivery_code", "");
            }
            s
        })
        .collect();
    Some(stages)
}

fn stages_bson(step_index: i32) -> Bson {
    Bson::Array(stage_template(step_index).unwrap_or_default().into_iter().map(Bson::Document).collect())
}

fn delivery_lookup(index: i32, name: &str) -> BsonDocument {
    doc! {
        "index": index,
        "name": name,
        "status": "",
        "end_date": "",
        "product_name": "",
        "product_quantity": 0,
        "factory_name": "",
        "factory_contact": "",
        "delivery_status": "",
        "delivery_code": "",
    }
}

/// The seven template steps.
#[must_use]
pub fn steps_template() -> Vec<BsonDocument> {
    vec![
        doc! { "index": 1, "name": "Sample factory selection", "status": "", "end_date": "", "factory_list": [] },
        doc! {
            "index": 2,
            "name": "Sample production",
            "status": "",
            "end_date": "",
            "factory_name": "",
            "order_date": "",
            "factory_contact": "",
            "stage": stages_bson(2),
        },
        delivery_lookup(3, "Sample delivery tracking"),
        doc! { "index": 4, "name": "Sample feedback", "status": "", "end_date": "", "feedback_history": [] },
        doc! { "index": 5, "name": "Production factory selection", "status": "", "end_date": "", "factory_list": [] },
        doc! { "index": 6, "name": "Production", "status": "", "end_date": "", "stage": stages_bson(6) },
        delivery_lookup(7, "Production delivery tracking"),
    ]
}

#[must_use]
pub fn steps_template_bson() -> Bson {
    Bson::Array(steps_template().into_iter().map(Bson::Document).collect())
}

/// A complete, freshly registered order document.
#[must_use]
pub fn seed_order_document(order_id: &str) -> BsonDocument {
    doc! {
        "order_id": order_id,
        "current_step_index": 1,
        "overall_status": "",
        "designer_id": Bson::Null,
        "factory_id": Bson::Null,
        "product_id": Bson::Null,
        "steps": steps_template_bson(),
        "last_updated": now_iso_minutes(),
    }
}
