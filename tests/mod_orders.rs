use bson::{Bson, doc};
use fablink_orders::Store;
use fablink_orders::backend::{DocumentDriver, TableDriver, TableStore};
use fablink_orders::orders::progress::STATUS_DONE;
use fablink_orders::orders::{Order, OrderRegistration, Progress, Rejection, bid_candidate};
use fablink_orders::query::{Filter, UpdateDoc};
use std::sync::Arc;

fn for_each_driver(f: impl Fn(&str, &Store)) {
    f("document", &Store::with_driver(Arc::new(DocumentDriver::in_memory())));
    f("table", &Store::with_driver(Arc::new(TableDriver::new(Arc::new(TableStore::in_memory()), "", 3))));
}

fn register(store: &Store, order_id: &str, designer: &str) {
    let reg = OrderRegistration {
        order_id: order_id.into(),
        designer_id: Some(designer.into()),
        product_id: Some("p-1".into()),
        fields: doc! { "product_name": "wool coat", "quantity": 40 },
    };
    let r = store.orders().register_order(&reg).unwrap();
    assert_eq!(r.matched, 1);
}

fn load(store: &Store, order_id: &str) -> Order {
    store.orders().load(order_id).unwrap().unwrap()
}

fn raw(store: &Store, order_id: &str) -> bson::Document {
    store.get_collection("orders").find_one(&Filter::eq("order_id", order_id)).unwrap()
}

#[test]
fn registration_seeds_template_once() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let o = load(store, "o-1");
        assert_eq!(o.current_step_index, 1, "{name}");
        assert_eq!(o.steps.len(), 7, "{name}");
        assert_eq!(o.steps[0].end_date, "", "{name}");
        assert_eq!(o.extra.get("product_name").and_then(|v| v.as_str()), Some("wool coat"));

        store.orders().complete("o-1", 1, None).unwrap();
        // re-registration refreshes fields but never resets progress
        let reg = OrderRegistration {
            order_id: "o-1".into(),
            designer_id: Some("d-1".into()),
            product_id: None,
            fields: doc! { "quantity": 50 },
        };
        let r = store.orders().register_order(&reg).unwrap();
        assert!(!r.upserted, "{name}");
        let o = load(store, "o-1");
        assert_eq!(o.current_step_index, 2, "{name}");
        assert_eq!(o.extra.get("quantity").and_then(serde_json::Value::as_i64), Some(50));
    });
}

#[test]
fn registration_rejects_reserved_fields() {
    let store = Store::in_memory();
    let reg = OrderRegistration { order_id: "o-1".into(), fields: doc! { "steps": [] }, ..Default::default() };
    assert!(store.orders().register_order(&reg).is_err());
    assert!(store.orders().load("o-1").unwrap().is_none());
}

#[test]
fn step_and_stage_scenario() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();

        let p = orders.complete("o-1", 1, None).unwrap();
        assert_eq!(p, Progress::Completed { current_step_index: 2, step_done: true, order_done: false }, "{name}");
        let o = load(store, "o-1");
        assert_eq!(o.current_step_index, 2);
        assert!(!o.steps[0].end_date.is_empty());
        assert_eq!(o.steps[0].status, STATUS_DONE);

        let p = orders.complete("o-1", 2, Some(1)).unwrap();
        assert_eq!(p, Progress::Completed { current_step_index: 2, step_done: false, order_done: false }, "{name}");
        let o = load(store, "o-1");
        let stages = o.steps[1].stage.as_ref().unwrap();
        assert!(stages[0].is_done());
        assert!(stages[1..].iter().all(|s| !s.is_done()));

        for k in 2..=5 {
            orders.complete("o-1", 2, Some(k)).unwrap();
        }
        let p = orders.complete("o-1", 2, Some(6)).unwrap();
        assert_eq!(p, Progress::Completed { current_step_index: 3, step_done: true, order_done: false }, "{name}");
        let o = load(store, "o-1");
        assert_eq!(o.current_step_index, 3);
        assert!(!o.steps[1].end_date.is_empty());
        assert!(o.last_updated.is_some());
    });
}

#[test]
fn stale_step_leaves_document_unchanged() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        store.orders().complete("o-1", 1, None).unwrap();
        let before = raw(store, "o-1");
        let p = store.orders().complete("o-1", 3, None).unwrap();
        assert_eq!(p, Progress::Rejected(Rejection::StaleStep { current: 2 }), "{name}");
        assert_eq!(raw(store, "o-1"), before, "{name}");
    });
}

#[test]
fn stage_out_of_order_reports_next_expected() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();
        orders.complete("o-1", 1, None).unwrap();
        orders.complete("o-1", 2, Some(1)).unwrap();
        let p = orders.complete("o-1", 2, Some(4)).unwrap();
        assert_eq!(p, Progress::Rejected(Rejection::StageOutOfOrder { expected: 2 }), "{name}");
        assert!(orders.complete("o-1", 2, Some(9)).is_err(), "{name}: stage out of range");
        assert!(orders.complete("o-1", 9, None).is_err(), "{name}: step out of range");
    });
}

#[test]
fn missing_order_is_a_rejection() {
    let store = Store::in_memory();
    assert_eq!(store.orders().complete("nope", 1, None).unwrap(), Progress::Rejected(Rejection::OrderNotFound));
}

#[test]
fn concurrent_completion_loses_cleanly() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let doc = raw(store, "o-1");
        let order = Order::from_document(&doc).unwrap();
        let Ok(t) = fablink_orders::orders::progress::plan(&order, 1, None).unwrap() else {
            panic!("plan rejected a valid completion");
        };
        // the other writer wins first
        store.orders().complete("o-1", 1, None).unwrap();
        let r = store.get_collection("orders").update_one(&t.guard, &t.update, false, &[]).unwrap();
        assert_eq!(r.matched, 0, "{name}");
        assert_eq!(load(store, "o-1").current_step_index, 2, "{name}");
    });
}

#[test]
fn whole_pipeline_finishes_order() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();
        for step in 1..=7 {
            if step == 2 || step == 6 {
                for k in 1..=6 {
                    assert!(matches!(orders.complete("o-1", step, Some(k)).unwrap(), Progress::Completed { .. }));
                }
            } else {
                assert!(matches!(orders.complete("o-1", step, None).unwrap(), Progress::Completed { .. }));
            }
        }
        let o = load(store, "o-1");
        assert!(o.is_done(), "{name}");
        assert_eq!(o.current_step_index, 7);
        assert!(o.steps.iter().all(|s| !s.end_date.is_empty()));
        assert_eq!(orders.complete("o-1", 7, None).unwrap(), Progress::Rejected(Rejection::AlreadyCompleted));
    });
}

#[test]
fn damaged_stage_list_is_repaired_on_read() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();
        orders.complete("o-1", 1, None).unwrap();
        orders.complete("o-1", 2, Some(1)).unwrap();
        let col = store.get_collection("orders");
        let stage1 = raw(store, "o-1").get_array("steps").unwrap()[1]
            .as_document()
            .unwrap()
            .get_array("stage")
            .unwrap()[0]
            .clone();
        col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("steps.1.stage", vec![stage1]), false, &[])
            .unwrap();
        col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("steps.5.stage", Bson::Null), false, &[])
            .unwrap();

        let report = orders.repair("o-1").unwrap().unwrap();
        assert_eq!(report.repaired_stage_lists, vec![2, 6], "{name}");
        let stored = Order::from_document(&raw(store, "o-1")).unwrap();
        let stages = stored.steps[1].stage.as_ref().unwrap();
        assert_eq!(stages.len(), 6, "{name}: repair persisted");
        assert!(stages[0].is_done(), "{name}: completed stage kept");
        assert_eq!(stored.steps[5].stage.as_ref().map(Vec::len), Some(6));
        assert!(orders.repair("o-1").unwrap().unwrap().is_empty(), "{name}: idempotent");

        let p = orders.complete("o-1", 2, Some(2)).unwrap();
        assert!(matches!(p, Progress::Completed { .. }), "{name}");
    });
}

#[test]
fn bid_candidates_target_step_one_only() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();
        orders.add_bid_candidate("o-1", &bid_candidate("f-1", "Atelier", "010-1", 900, "2026-11-01")).unwrap();
        orders.add_bid_candidate("o-1", &bid_candidate("f-2", "Sewline", "010-2", 800, "2026-11-05")).unwrap();
        // resubmission replaces the earlier bid
        orders.add_bid_candidate("o-1", &bid_candidate("f-1", "Atelier", "010-1", 850, "2026-11-02")).unwrap();

        let o = load(store, "o-1");
        let bids = o.steps[0].factory_list();
        assert_eq!(bids.len(), 2, "{name}");
        let f1: Vec<_> = bids.iter().filter(|b| b["factory_id"] == "f-1").collect();
        assert_eq!(f1.len(), 1);
        assert_eq!(f1[0]["work_price"], 850);
        assert!(o.steps[1..].iter().all(|s| s.factory_list().is_empty()), "{name}: siblings untouched");

        orders.withdraw_bid_candidate("o-1", "f-2").unwrap();
        assert_eq!(load(store, "o-1").steps[0].factory_list().len(), 1, "{name}");
        assert!(orders.add_bid_candidate("o-1", &doc! { "name": "no id" }).is_err());
    });
}

#[test]
fn accepting_a_bid_records_the_factory_once() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        let orders = store.orders();
        orders.add_bid_candidate("o-1", &bid_candidate("f-1", "Atelier", "010-1", 900, "2026-11-01")).unwrap();
        orders.add_bid_candidate("o-1", &bid_candidate("f-2", "Sewline", "010-2", 800, "2026-11-05")).unwrap();

        assert_eq!(orders.accept_bid("o-1", "f-9").unwrap().matched, 0, "{name}: unknown bidder");
        assert_eq!(orders.accept_bid("o-1", "f-2").unwrap().matched, 1, "{name}");
        assert_eq!(orders.accept_bid("o-1", "f-1").unwrap().matched, 0, "{name}: already accepted");

        let d = raw(store, "o-1");
        assert_eq!(d.get_str("factory_id").unwrap(), "f-2");
        assert_eq!(d.get_str("factory_name").unwrap(), "Sewline");
        assert_eq!(d.get_str("due_date").unwrap(), "2026-11-05");
        let o = load(store, "o-1");
        assert_eq!(o.steps[1].extra.get("factory_contact").and_then(|v| v.as_str()), Some("010-2"));

        let listed = orders.orders_for_factory("f-2").unwrap();
        assert_eq!(listed.len(), 1, "{name}");
        assert_eq!(orders.orders_for_factory("f-1").unwrap().len(), 1, "{name}: still a bidder");
    });
}

#[test]
fn designer_listing_sorted_by_recency() {
    for_each_driver(|name, store| {
        register(store, "o-1", "d-1");
        register(store, "o-2", "d-1");
        register(store, "o-3", "d-2");
        let col = store.get_collection("orders");
        col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("last_updated", "2026-10-02T09:00+00:00"), false, &[])
            .unwrap();
        col.update_one(&Filter::eq("order_id", "o-2"), &UpdateDoc::new().set("last_updated", "2026-10-01T09:00+00:00"), false, &[])
            .unwrap();
        let ids: Vec<String> =
            store.orders().orders_for_designer("d-1").unwrap().into_iter().map(|o| o.order_id).collect();
        assert_eq!(ids, ["o-1", "o-2"], "{name}");
    });
}

#[test]
fn persisted_store_reopens_with_progress() {
    let dir = tempfile::tempdir().unwrap();
    for backend in ["document", "table"] {
        let mut cfg = fablink_orders::config::StoreConfig::default();
        cfg.apply_env(|k| match k {
            "FABLINK_BACKEND" => Some(backend.into()),
            "FABLINK_DATA_DIR" => Some(dir.path().join(backend).display().to_string()),
            _ => None,
        })
        .unwrap();
        {
            let store = Store::open(&cfg).unwrap();
            store.ensure_indexes();
            register(&store, "o-1", "d-1");
            store.orders().complete("o-1", 1, None).unwrap();
        }
        let store = Store::open(&cfg).unwrap();
        assert_eq!(load(&store, "o-1").current_step_index, 2, "{backend}");
    }
}

/// Store `o-1` with steps that carry no `status` or `end_date`, the way early registrations wrote them.
fn store_bare_order(store: &Store) {
    let mut steps = fablink_orders::orders::template::steps_template();
    for step in &mut steps {
        step.remove("status");
        step.remove("end_date");
        if let Ok(stages) = step.get_array_mut("stage") {
            for st in stages.iter_mut().filter_map(Bson::as_document_mut) {
                st.remove("status");
                st.remove("end_date");
            }
        }
    }
    let update = UpdateDoc::new().set("current_step_index", 1).set("steps", steps);
    store.get_collection("orders").update_one(&Filter::eq("order_id", "o-1"), &update, true, &[]).unwrap();
}

#[test]
fn orders_without_end_dates_still_progress() {
    for_each_driver(|name, store| {
        store_bare_order(store);
        let orders = store.orders();
        let p = orders.complete("o-1", 1, None).unwrap();
        assert_eq!(p, Progress::Completed { current_step_index: 2, step_done: true, order_done: false }, "{name}");
        let p = orders.complete("o-1", 2, Some(1)).unwrap();
        assert_eq!(p, Progress::Completed { current_step_index: 2, step_done: false, order_done: false }, "{name}");

        let stored = raw(store, "o-1");
        let steps = stored.get_array("steps").unwrap();
        for step in steps.iter().filter_map(Bson::as_document) {
            assert!(step.get_str("end_date").is_ok(), "{name}: step shape made canonical");
        }
        assert!(orders.repair("o-1").unwrap().unwrap().is_empty(), "{name}");
    });
}

#[test]
fn repair_reports_steps_missing_progress_fields() {
    for_each_driver(|name, store| {
        store_bare_order(store);
        let report = store.orders().repair("o-1").unwrap().unwrap();
        assert_eq!(report.normalised_steps, (1..=7).collect::<Vec<_>>(), "{name}");
        assert!(report.repaired_stage_lists.is_empty(), "{name}");
        assert!(store.orders().repair("o-1").unwrap().unwrap().is_empty(), "{name}: idempotent");
    });
}
