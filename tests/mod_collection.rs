use bson::{Bson, doc};
use fablink_orders::Store;
use fablink_orders::backend::{DocumentDriver, TableDriver, TableStore};
use fablink_orders::errors::DbError;
use fablink_orders::query::{Filter, FindOptions, Order, UpdateDoc};
use std::sync::Arc;

/// Run `f` once against each driver, each on a fresh store.
fn for_each_driver(f: impl Fn(&str, &Store)) {
    f("document", &Store::with_driver(Arc::new(DocumentDriver::in_memory())));
    // small pages so every scan crosses page boundaries
    f("table", &Store::with_driver(Arc::new(TableDriver::new(Arc::new(TableStore::in_memory()), "t_", 2))));
}

fn seed(store: &Store) {
    let col = store.get_collection("orders");
    let rows = [
        doc! { "order_id": "o-1", "designer_id": "d-1", "qty": 10, "steps": [ { "index": 1, "tags": ["rush"] }, { "index": 2 } ] },
        doc! { "order_id": "o-2", "designer_id": "d-1", "qty": 20_i64, "steps": [ { "index": 1, "tags": [] } ] },
        doc! { "order_id": "o-3", "designer_id": "d-2", "qty": 10.0, "factory_id": "f-1" },
        doc! { "order_id": "o-4", "designer_id": Bson::Null },
    ];
    for row in rows {
        let mut update = UpdateDoc::new();
        for (k, v) in row.iter().filter(|(k, _)| k.as_str() != "order_id") {
            update = update.set(k.as_str(), v.clone());
        }
        let id = row.get_str("order_id").unwrap();
        col.update_one(&Filter::eq("order_id", id), &update, true, &[]).unwrap();
    }
}

fn ids(store: &Store, filter: &bson::Document) -> Vec<String> {
    let mut out: Vec<String> = store
        .get_collection("orders")
        .find_doc(filter, &FindOptions::default())
        .unwrap()
        .map(|d| d.get_str("order_id").unwrap().to_string())
        .collect();
    out.sort();
    out
}

#[test]
fn filter_vocabulary_matches_on_both_drivers() {
    for_each_driver(|name, store| {
        seed(store);
        assert_eq!(ids(store, &doc! {}), ["o-1", "o-2", "o-3", "o-4"], "{name}");
        assert_eq!(ids(store, &doc! { "designer_id": "d-1" }), ["o-1", "o-2"], "{name}");
        assert_eq!(ids(store, &doc! { "qty": 10 }), ["o-1", "o-3"], "{name}: numeric width");
        assert_eq!(ids(store, &doc! { "steps.index": 2 }), ["o-1"], "{name}: dotted any-element");
        assert_eq!(ids(store, &doc! { "steps.tags": "rush" }), ["o-1"], "{name}: leaf membership");
        assert_eq!(ids(store, &doc! { "steps.0.index": 1 }), ["o-1", "o-2"], "{name}: positional");
        assert_eq!(ids(store, &doc! { "factory_id": Bson::Null }), ["o-1", "o-2", "o-4"], "{name}: null or missing");
        assert_eq!(
            ids(store, &doc! { "$or": [ { "designer_id": "d-2" }, { "qty": 20 } ] }),
            ["o-2", "o-3"],
            "{name}: $or"
        );
        assert_eq!(
            ids(store, &doc! { "designer_id": "d-1", "$or": [ { "qty": 20 }, { "factory_id": "f-1" } ] }),
            ["o-2"],
            "{name}: $or ANDed with siblings"
        );
        assert_eq!(ids(store, &doc! { "designer_id": { "$in": ["d-2", "d-9"] } }), ["o-3"], "{name}: $in");
    });
}

#[test]
fn cursor_sorts_skips_and_limits_in_fixed_order() {
    for_each_driver(|name, store| {
        seed(store);
        let col = store.get_collection("orders");
        let got: Vec<String> = col
            .find(&Filter::True, &FindOptions::default())
            .limit(2)
            .skip(1)
            .sort("order_id", Order::Desc)
            .map(|d| d.get_str("order_id").unwrap().to_string())
            .collect();
        assert_eq!(got, ["o-3", "o-2"], "{name}");
    });
}

#[test]
fn projection_keeps_listed_fields() {
    for_each_driver(|name, store| {
        seed(store);
        let opts = FindOptions { projection: Some(vec!["order_id".into()]) };
        let docs = store.get_collection("orders").find(&Filter::eq("order_id", "o-1"), &opts).to_vec();
        assert_eq!(docs, vec![doc! { "order_id": "o-1" }], "{name}");
    });
}

#[test]
fn set_reports_modified_only_on_change() {
    for_each_driver(|name, store| {
        seed(store);
        let col = store.get_collection("orders");
        let u = UpdateDoc::new().set("meta.note", "hello");
        let first = col.update_one(&Filter::eq("order_id", "o-1"), &u, false, &[]).unwrap();
        assert_eq!((first.matched, first.modified), (1, 1), "{name}");
        let second = col.update_one(&Filter::eq("order_id", "o-1"), &u, false, &[]).unwrap();
        assert_eq!((second.matched, second.modified), (1, 0), "{name}");
        let d = col.find_one(&Filter::eq("order_id", "o-1")).unwrap();
        assert_eq!(d.get_document("meta").unwrap().get_str("note").unwrap(), "hello");
    });
}

#[test]
fn upsert_and_no_upsert_miss() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        let u = UpdateDoc::new().set_on_insert("created", true).set("n", 1);
        let miss = col.update_one(&Filter::eq("order_id", "o-9"), &u, false, &[]).unwrap();
        assert_eq!((miss.matched, miss.modified), (0, 0), "{name}");
        assert_eq!(col.count_documents(&Filter::True), 0, "{name}");
        let ins = col.update_one(&Filter::eq("order_id", "o-9"), &u, true, &[]).unwrap();
        assert!(ins.upserted, "{name}");
        assert_eq!((ins.matched, ins.modified), (1, 1), "{name}");
        let u2 = UpdateDoc::new().set_on_insert("created", false).set("n", 2);
        let again = col.update_one(&Filter::eq("order_id", "o-9"), &u2, true, &[]).unwrap();
        assert!(!again.upserted, "{name}");
        let d = col.find_one(&Filter::eq("order_id", "o-9")).unwrap();
        assert_eq!(d.get_str("order_id").unwrap(), "o-9");
        assert!(d.get_bool("created").unwrap());
        assert_eq!(d.get_i32("n").unwrap(), 2);
    });
}

#[test]
fn conflicting_set_and_set_on_insert_is_rejected_before_mutation() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        let bad = doc! { "$setOnInsert": { "a.b": 1 }, "$set": { "a": 2 } };
        let err = col.update_one_doc(&doc! { "order_id": "o-1" }, &bad, true, &[]).unwrap_err();
        assert!(matches!(err, DbError::MalformedOperation(_)), "{name}");
        assert_eq!(col.count_documents(&Filter::True), 0, "{name}");
    });
}

#[test]
fn array_filter_scopes_push_and_pull() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        let init = doc! { "$set": { "steps": [ { "index": 1, "items": [] }, { "index": 2, "items": [ { "k": "a" } ] } ] } };
        col.update_one_doc(&doc! { "order_id": "o-1" }, &init, true, &[]).unwrap();
        col.update_one_doc(
            &doc! { "order_id": "o-1" },
            &doc! { "$push": { "steps.$[s].items": { "k": "b" } } },
            false,
            &[doc! { "s.index": 2 }],
        )
        .unwrap();
        col.update_one_doc(
            &doc! { "order_id": "o-1" },
            &doc! { "$pull": { "steps.$[s].items": { "k": "a" } } },
            false,
            &[doc! { "s": { "index": 2 } }],
        )
        .unwrap();
        let d = col.find_one(&Filter::eq("order_id", "o-1")).unwrap();
        let steps = d.get_array("steps").unwrap();
        let items = |i: usize| steps[i].as_document().unwrap().get_array("items").unwrap().clone();
        assert!(items(0).is_empty(), "{name}: sibling untouched");
        assert_eq!(items(1), vec![Bson::Document(doc! { "k": "b" })], "{name}");
    });
}

#[test]
fn unknown_placeholder_name_is_malformed() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        let err = col
            .update_one_doc(
                &doc! { "order_id": "o-1" },
                &doc! { "$push": { "steps.$[x].items": 1 } },
                true,
                &[doc! { "s.index": 2 }],
            )
            .unwrap_err();
        assert!(matches!(err, DbError::MalformedOperation(_)), "{name}");
    });
}

#[test]
fn unique_index_on_document_driver() {
    let store = Store::in_memory();
    seed(&store);
    assert_eq!(store.ensure_indexes(), 4);
    let col = store.get_collection("orders");
    let err = col.update_one(&Filter::eq("order_id", "o-2"), &UpdateDoc::new().set("order_id", "o-1"), false, &[]);
    assert!(matches!(err, Err(DbError::DuplicateKey { .. })));
    assert_eq!(col.count_documents(&Filter::eq("designer_id", "d-1")), 2);
}

#[test]
fn changing_order_id_moves_the_document() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("n", 1), true, &[]).unwrap();
        let renamed = col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("order_id", "o-9"), false, &[]).unwrap();
        assert_eq!((renamed.matched, renamed.modified), (1, 1), "{name}");
        assert_eq!(col.find_one(&Filter::eq("order_id", "o-9")).unwrap().get_i32("n").unwrap(), 1, "{name}");
        assert!(col.find_one(&Filter::eq("order_id", "o-1")).is_none(), "{name}");

        let again = col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("n", 2), true, &[]).unwrap();
        assert!(again.upserted, "{name}: the old identity is free again");
        assert_eq!((again.matched, again.modified), (1, 1), "{name}");
        assert_eq!(col.count_documents(&Filter::True), 2, "{name}");
    });
}

#[test]
fn other_identity_fields_are_found_by_value() {
    for_each_driver(|name, store| {
        let col = store.get_collection("orders");
        col.update_one(&Filter::eq("order_id", "o-1"), &UpdateDoc::new().set("id", "x-1"), true, &[]).unwrap();
        col.update_one(&Filter::eq("id", "x-2"), &UpdateDoc::new().set("n", 1), true, &[]).unwrap();
        assert_eq!(col.find_one(&Filter::eq("id", "x-1")).unwrap().get_str("order_id").unwrap(), "o-1", "{name}");
        let bumped = col.update_one(&Filter::eq("id", "x-2"), &UpdateDoc::new().set("n", 2), false, &[]).unwrap();
        assert_eq!((bumped.matched, bumped.modified), (1, 1), "{name}");

        // an order_id given later makes the document reachable by it
        col.update_one(&Filter::eq("id", "x-2"), &UpdateDoc::new().set("order_id", "o-2"), false, &[]).unwrap();
        assert_eq!(col.find_one(&Filter::eq("order_id", "o-2")).unwrap().get_i32("n").unwrap(), 2, "{name}");
        assert_eq!(col.count_documents(&Filter::True), 2, "{name}");
    });
}
