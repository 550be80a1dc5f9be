#![forbid(unsafe_code)]

use std::sync::Arc;

use ordo_core::{FulfillmentStatus, OrderRecord};
use ordo_store::{spawn_ingest, OrderDelta, OrderStore};

fn rec(id: &str, ts: i64, status: FulfillmentStatus) -> OrderRecord { OrderRecord::new(id, id, ts, status) }

async fn run_sequence(seq: &[OrderDelta]) -> Vec<(String, FulfillmentStatus)> {
    let store = Arc::new(OrderStore::new(128));
    let (tx, handle) = spawn_ingest(Arc::clone(&store), 128);
    for d in seq.iter().cloned() { let _ = tx.send(d).await; }
    drop(tx);
    handle.await.unwrap();
    let snap = store.current();
    let mut canon: Vec<(String, FulfillmentStatus)> = snap.items.iter().map(|o| (o.id.clone(), o.status)).collect();
    canon.sort_unstable();
    canon
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deterministic_across_runs() {
    let seq = vec![
        OrderDelta::Upsert(rec("a", 1, FulfillmentStatus::NotFulfilled)),
        OrderDelta::Upsert(rec("b", 2, FulfillmentStatus::NotFulfilled)),
        OrderDelta::Upsert(rec("c", 3, FulfillmentStatus::NotFulfilled)),
        // duplicate and out-of-order updates
        OrderDelta::Upsert(rec("b", 2, FulfillmentStatus::Fulfilled)),
        OrderDelta::Upsert(rec("b", 2, FulfillmentStatus::Fulfilled)),
        OrderDelta::Remove("c".into()),
        OrderDelta::Upsert(rec("d", 4, FulfillmentStatus::Canceled)),
    ];

    let c1 = run_sequence(&seq).await;
    let c2 = run_sequence(&seq).await;
    assert_eq!(c1, c2, "canonical collection view must be deterministic across runs");
    assert_eq!(
        c1,
        vec![
            ("a".to_string(), FulfillmentStatus::NotFulfilled),
            ("b".to_string(), FulfillmentStatus::Fulfilled),
            ("d".to_string(), FulfillmentStatus::Canceled),
        ]
    );
}

#[tokio::test]
async fn malformed_deltas_are_skipped() {
    let store = Arc::new(OrderStore::new(8));
    let (tx, handle) = spawn_ingest(Arc::clone(&store), 8);
    tx.send(OrderDelta::Upsert(rec("", 1, FulfillmentStatus::NotFulfilled))).await.unwrap();
    tx.send(OrderDelta::Upsert(rec("ok", 2, FulfillmentStatus::NotFulfilled))).await.unwrap();
    drop(tx);
    handle.await.unwrap();
    assert_eq!(store.len(), 1);
    assert!(store.get("ok").is_some());
}
