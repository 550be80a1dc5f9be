//! Ordo store: the shared order collection, its published snapshots and the
//! coalescing ingest loop producers can feed.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use arc_swap::ArcSwap;
use metrics::{counter, gauge};
use ordo_core::{FulfillmentStatus, OrderId, OrderRecord, PaymentStatus, RecordError};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub mod collection;

pub use collection::{ListView, OrderCollection, OrderSummary, UpsertOutcome};

/// Mutation sent by upstream producers (poll batches, push events, user actions).
#[derive(Debug, Clone)]
pub enum OrderDelta {
    Upsert(OrderRecord),
    Remove(OrderId),
}

impl OrderDelta {
    pub fn id(&self) -> &str {
        match self {
            OrderDelta::Upsert(r) => &r.id,
            OrderDelta::Remove(id) => id,
        }
    }
}

/// Immutable view of the collection published after every mutation.
#[derive(Debug, Clone, Default)]
pub struct OrderSnapshot {
    pub epoch: u64,
    /// Newest first.
    pub items: Vec<OrderRecord>,
}

/// Called with each newly inserted (not replaced) record, outside the store lock.
pub type InsertHook = Arc<dyn Fn(&OrderRecord) + Send + Sync>;

/// Shared handle over one session's collection. All mutation funnels through
/// `upsert`/`remove_by_id`; readers get lock-free snapshots.
pub struct OrderStore {
    inner: Mutex<OrderCollection>,
    snap: ArcSwap<OrderSnapshot>,
    epoch_tx: watch::Sender<u64>,
    hooks: RwLock<Vec<InsertHook>>,
}

impl OrderStore {
    pub fn new(cap: usize) -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self {
            inner: Mutex::new(OrderCollection::with_capacity(cap)),
            snap: ArcSwap::from_pointee(OrderSnapshot::default()),
            epoch_tx,
            hooks: RwLock::new(Vec::new()),
        }
    }

    pub fn on_insert(&self, hook: InsertHook) {
        if let Ok(mut g) = self.hooks.write() { g.push(hook); }
    }

    fn lock(&self) -> MutexGuard<'_, OrderCollection> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Caller holds the collection lock, so epochs are published in mutation order.
    fn publish(&self, coll: &OrderCollection) {
        let epoch = self.snap.load().epoch.saturating_add(1);
        self.snap.store(Arc::new(OrderSnapshot { epoch, items: coll.to_vec() }));
        self.epoch_tx.send_replace(epoch);
        gauge!("collection_size", coll.len() as f64);
    }

    fn fire_hooks(&self, inserted: &[OrderRecord]) {
        if inserted.is_empty() { return; }
        let hooks = match self.hooks.read() { Ok(g) => g.clone(), Err(_) => return };
        for r in inserted { for h in hooks.iter() { h(r); } }
    }

    pub fn upsert(&self, record: OrderRecord) -> Result<UpsertOutcome, RecordError> {
        let mut out = self.upsert_many(vec![record]);
        out.pop().unwrap_or_else(|| Err(RecordError::MalformedRecord("empty batch".into())))
    }

    /// Apply a batch under one lock and publish a single snapshot. Records are
    /// applied oldest first so the newest ends up at the front.
    pub fn upsert_many(&self, batch: Vec<OrderRecord>) -> Vec<Result<UpsertOutcome, RecordError>> {
        let mut slots: Vec<Option<OrderRecord>> = batch.into_iter().map(Some).collect();
        let mut order: Vec<usize> = (0..slots.len()).collect();
        order.sort_by_key(|i| slots[*i].as_ref().map(|r| r.created_at).unwrap_or_default());
        let mut results: Vec<Option<Result<UpsertOutcome, RecordError>>> = (0..slots.len()).map(|_| None).collect();
        let mut inserted = Vec::new();
        {
            let mut coll = self.lock();
            let mut changed = false;
            for i in order {
                let Some(rec) = slots[i].take() else { continue };
                let res = coll.upsert(rec);
                match &res {
                    Ok(UpsertOutcome::Inserted { .. }) => {
                        changed = true;
                        if let Some(r) = coll.iter().next() { inserted.push(r.clone()); }
                    }
                    Ok(UpsertOutcome::Replaced) => changed = true,
                    Err(e) => warn!(error = %e, "rejected order upsert"),
                }
                results[i] = Some(res);
            }
            if changed { self.publish(&coll); }
        }
        self.fire_hooks(&inserted);
        results.into_iter().map(|r| r.unwrap_or_else(|| Err(RecordError::MalformedRecord("unprocessed".into())))).collect()
    }

    pub fn remove_by_id(&self, id: &str) -> bool {
        let mut coll = self.lock();
        let removed = coll.remove_by_id(id);
        if removed { self.publish(&coll); }
        removed
    }

    pub fn current(&self) -> Arc<OrderSnapshot> { self.snap.load_full() }
    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }
    pub fn get(&self, id: &str) -> Option<OrderRecord> { self.lock().get(id).cloned() }

    pub fn by_status(&self, status: FulfillmentStatus) -> Arc<Vec<OrderRecord>> { self.lock().by_status(status) }
    pub fn unfulfilled(&self) -> Arc<Vec<OrderRecord>> { self.lock().unfulfilled() }
    pub fn by_payment_status(&self, p: PaymentStatus) -> Arc<Vec<OrderRecord>> { self.lock().by_payment_status(p) }
    pub fn summary(&self) -> Arc<OrderSummary> { self.lock().summary() }
}

/// Pending order changes between ingest ticks, one slot per order id.
///
/// Only the latest change to an order matters when the batch is applied: a
/// second `Upsert` carries the newer state of the same order, a `Remove` makes
/// any pending `Upsert` pointless, and an `Upsert` after a pending `Remove`
/// means the order came back. Slots keep the position of the first change so
/// batches apply orders in arrival order. When full, the oldest pending order
/// is dropped and counted.
pub struct Coalescer {
    map: FxHashMap<OrderId, OrderDelta>,
    order: VecDeque<OrderId>,
    cap: usize,
    dropped: u64,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1), dropped: 0 }
    }

    pub fn len(&self) -> usize { self.map.len() }
    pub fn is_empty(&self) -> bool { self.map.is_empty() }
    pub fn dropped(&self) -> u64 { self.dropped }

    pub fn push(&mut self, d: OrderDelta) {
        let id = d.id().to_string();
        if self.map.contains_key(&id) {
            counter!("ingest_coalesced_total", 1u64);
        } else {
            if self.order.len() >= self.cap {
                if let Some(old) = self.order.pop_front() {
                    self.map.remove(&old);
                    self.dropped += 1;
                    counter!("ingest_dropped_total", 1u64);
                    debug!(order = %old, "ingest queue full; dropped pending order change");
                }
            }
            self.order.push_back(id.clone());
        }
        self.map.insert(id, d);
    }

    pub fn drain_ready(&mut self) -> Vec<OrderDelta> {
        let mut out = Vec::with_capacity(self.order.len());
        while let Some(id) = self.order.pop_front() {
            if let Some(d) = self.map.remove(&id) {
                out.push(d);
            }
        }
        out
    }
}

fn apply_batch(store: &OrderStore, batch: Vec<OrderDelta>) {
    let mut upserts = Vec::new();
    for d in batch {
        match d {
            OrderDelta::Upsert(r) => upserts.push(r),
            OrderDelta::Remove(id) => {
                if !upserts.is_empty() { store.upsert_many(std::mem::take(&mut upserts)); }
                store.remove_by_id(&id);
            }
        }
    }
    if !upserts.is_empty() { store.upsert_many(upserts); }
}

/// Spawn an ingest loop that coalesces deltas and applies them to `store` on a
/// short tick. The loop drains and exits once every sender is dropped.
pub fn spawn_ingest(store: Arc<OrderStore>, cap: usize) -> (mpsc::Sender<OrderDelta>, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<OrderDelta>(cap.max(1));
    let handle = tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(8));
        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(d) => coalescer.push(d),
                        None => {
                            debug!("delta channel closed; draining and exiting ingest loop");
                            let batch = coalescer.drain_ready();
                            if !batch.is_empty() { apply_batch(&store, batch); }
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    let batch = coalescer.drain_ready();
                    if !batch.is_empty() { apply_batch(&store, batch); }
                }
            }
        }
        info!(dropped = coalescer.dropped(), "ingest loop stopped");
    });
    (tx, handle)
}
