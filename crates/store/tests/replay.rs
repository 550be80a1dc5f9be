#![forbid(unsafe_code)]

use ordo_core::{FulfillmentStatus, OrderRecord};
use ordo_store::{OrderStore, UpsertOutcome};

fn raw(id: &str, number: &str, ts: &str, status: &str) -> serde_json::Value {
    serde_json::json!({
        "_id": id,
        "number": number,
        "_createdDate": ts,
        "fulfillmentStatus": status,
        "buyerInfo": { "email": format!("{}@example.com", number) },
    })
}

fn rec(v: serde_json::Value) -> OrderRecord { OrderRecord::from_raw(&v).unwrap() }

fn ids(v: &[OrderRecord]) -> Vec<&str> { v.iter().map(|o| o.id.as_str()).collect() }

#[test]
fn status_view_follows_upserts_without_manual_invalidation() {
    let store = OrderStore::new(100);
    store.upsert(rec(raw("1", "1001", "2024-01-01T00:00:00Z", "FULFILLED"))).unwrap();
    store.upsert(rec(raw("2", "1002", "2024-01-02T00:00:00Z", "NOT_FULFILLED"))).unwrap();

    let fulfilled = store.by_status(FulfillmentStatus::Fulfilled);
    assert_eq!(ids(&fulfilled), vec!["1"]);

    store.upsert(rec(raw("3", "1003", "2024-01-03T00:00:00Z", "FULFILLED"))).unwrap();
    let fulfilled = store.by_status(FulfillmentStatus::Fulfilled);
    assert_eq!(ids(&fulfilled), vec!["3", "1"]);
}

#[test]
fn replay_basic_sequence() {
    let store = OrderStore::new(100);
    // add, duplicate add, add, update, delete
    assert!(matches!(store.upsert(rec(raw("a", "1", "2024-01-01T00:00:00Z", "NOT_FULFILLED"))), Ok(UpsertOutcome::Inserted { .. })));
    assert_eq!(store.upsert(rec(raw("a", "1", "2024-01-01T00:00:00Z", "NOT_FULFILLED"))), Ok(UpsertOutcome::Replaced));
    store.upsert(rec(raw("b", "2", "2024-01-01T00:00:01Z", "NOT_FULFILLED"))).unwrap();
    let snap1 = store.current();
    assert_eq!(snap1.epoch, 3);
    assert_eq!(ids(&snap1.items), vec!["b", "a"]);

    store.upsert(rec(raw("a", "1", "2030-01-01T00:00:00Z", "FULFILLED"))).unwrap();
    store.remove_by_id("b");
    let snap2 = store.current();
    assert_eq!(snap2.epoch, 5);
    assert_eq!(snap2.items.len(), 1);
    assert_eq!(snap2.items[0].status, FulfillmentStatus::Fulfilled);
    // created_at is immutable once stored
    assert_eq!(snap2.items[0].created_at, snap1.items[1].created_at);
    // earlier snapshots are untouched
    assert_eq!(snap1.items.len(), 2);
}
