//! Ordo public API façade (in-process).
//!
//! A [`Session`] is the context object producers and consumers share: one
//! order collection, its search orchestrator and the customer count cache,
//! wired together. Frontends depend on the [`OrdoApi`] trait.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use metrics::counter;
use ordo_core::{Clock, OrderFilter, OrderRecord, RecordError, Settings, StatusKey, SystemClock};
use ordo_counts::{CountConfig, CustomerCounts};
use ordo_gateway::{IdentityResolver, OrderGateway, ResilientGateway, ResilientResolver, RetryPolicy};
use ordo_persist::{KvStore, MemoryKv};
use ordo_search::{SearchConfig, SearchError, SearchOrchestrator};
use ordo_store::{OrderDelta, OrderStore};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use ordo_core::FulfillmentStatus;
pub use ordo_core::PaymentStatus;
pub use ordo_search::{SearchMeta, SearchOutcome};
pub use ordo_store::{OrderSnapshot, OrderSummary, UpsertOutcome};

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrdoError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("superseded: {0}")]
    Superseded(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type OrdoResult<T> = Result<T, OrdoError>;

impl From<RecordError> for OrdoError {
    fn from(e: RecordError) -> Self { OrdoError::Validation(e.to_string()) }
}

impl From<SearchError> for OrdoError {
    fn from(e: SearchError) -> Self { OrdoError::Superseded(e.to_string()) }
}

/// Runtime state exposed to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Stats {
    pub session_id: String,
    pub orders: usize,
    pub collection_cap: usize,
    pub epoch: u64,
    pub search_cache_entries: usize,
    pub searches_executed: u64,
    pub customer_counts: usize,
}

/// Declarative Ordo API surface.
#[async_trait::async_trait]
pub trait OrdoApi: Send + Sync {
    fn upsert(&self, record: OrderRecord) -> OrdoResult<UpsertOutcome>;

    /// Normalize a loosely typed payload, then upsert it.
    fn upsert_raw(&self, raw: &serde_json::Value) -> OrdoResult<UpsertOutcome>;

    fn remove(&self, id: &str) -> bool;

    /// Current newest-first snapshot of the collection.
    fn snapshot(&self) -> Arc<OrderSnapshot>;

    fn by_status(&self, status: FulfillmentStatus) -> Arc<Vec<OrderRecord>>;
    fn unfulfilled(&self) -> Arc<Vec<OrderRecord>>;
    fn by_payment_status(&self, status: PaymentStatus) -> Arc<Vec<OrderRecord>>;
    fn summary(&self) -> Arc<OrderSummary>;

    async fn search(&self, query: &str, filters: &OrderFilter) -> OrdoResult<SearchOutcome>;

    /// Like `search`, but only the last call in a burst runs.
    async fn search_debounced(&self, query: &str, filters: &OrderFilter) -> OrdoResult<SearchOutcome>;

    /// Local-only matches for immediate display.
    fn preview(&self, query: &str, filters: &OrderFilter) -> Vec<OrderRecord>;

    async fn search_status(&self, key: StatusKey) -> OrdoResult<SearchOutcome>;
    async fn load_more(&self, key: StatusKey) -> OrdoResult<SearchOutcome>;

    /// Cached count, resolving in the background when unknown or stale.
    fn customer_count(&self, email: &str) -> u64;

    /// Resolve now and wait for the result.
    async fn refresh_customer_count(&self, email: &str) -> u64;

    fn stats(&self) -> Stats;
}

/// Handle to a running ingest loop. Dropping every sender stops the loop
/// after a final drain; `cancel` aborts it immediately.
pub struct IngestHandle {
    pub tx: tokio::sync::mpsc::Sender<OrderDelta>,
    pub cancel: CancelHandle,
}

pub struct CancelHandle { task: Option<tokio::task::JoinHandle<()>> }

impl CancelHandle {
    pub fn cancel(mut self) { if let Some(h) = self.task.take() { h.abort(); } }

    /// Wait for the loop to finish draining.
    pub async fn join(mut self) {
        if let Some(h) = self.task.take() { let _ = h.await; }
    }
}

pub struct SessionBuilder {
    gateway: Arc<dyn OrderGateway>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    kv: Option<Arc<dyn KvStore>>,
    clock: Option<Arc<dyn Clock>>,
    settings: Settings,
    retry: Option<RetryPolicy>,
}

impl SessionBuilder {
    pub fn resolver(mut self, r: Arc<dyn IdentityResolver>) -> Self { self.resolver = Some(r); self }
    pub fn kv(mut self, kv: Arc<dyn KvStore>) -> Self { self.kv = Some(kv); self }
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self { self.clock = Some(clock); self }
    pub fn settings(mut self, settings: Settings) -> Self { self.settings = settings; self }
    /// Overrides the policy derived from settings.
    pub fn retry(mut self, policy: RetryPolicy) -> Self { self.retry = Some(policy); self }

    pub fn build(self) -> Arc<Session> {
        let t0 = Instant::now();
        let settings = self.settings;
        let policy = self.retry.unwrap_or_else(|| RetryPolicy::from_settings(&settings));
        let gateway: Arc<dyn OrderGateway> = Arc::new(ResilientGateway::new(self.gateway, policy));
        let resolver: Option<Arc<dyn IdentityResolver>> = self
            .resolver
            .map(|r| Arc::new(ResilientResolver::new(r, policy)) as Arc<dyn IdentityResolver>);
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let kv: Arc<dyn KvStore> = self.kv.unwrap_or_else(|| Arc::new(MemoryKv::new()));

        let store = Arc::new(OrderStore::new(settings.collection_cap));
        let counts = CustomerCounts::open(
            Arc::clone(&gateway),
            kv,
            Arc::clone(&clock),
            CountConfig::from_settings(&settings),
        );
        let mut search = SearchOrchestrator::new(
            Arc::clone(&store),
            gateway,
            clock,
            SearchConfig::from_settings(&settings),
        );
        if let Some(r) = resolver { search = search.with_resolver(r); }

        // A previously unseen order makes its customer's count stale.
        let hook_counts = Arc::clone(&counts);
        store.on_insert(Arc::new(move |r: &OrderRecord| hook_counts.observe_order(r)));

        let id = uuid::Uuid::new_v4().to_string();
        info!(session = %id, cap = settings.collection_cap, counts = counts.len(), took_ms = %t0.elapsed().as_millis(), "session ready");
        Arc::new(Session { id, settings, store, search, counts })
    }
}

/// In-process implementation that calls internal crates directly.
pub struct Session {
    id: String,
    settings: Settings,
    store: Arc<OrderStore>,
    search: SearchOrchestrator,
    counts: Arc<CustomerCounts>,
}

impl Session {
    pub fn builder(gateway: Arc<dyn OrderGateway>) -> SessionBuilder {
        SessionBuilder { gateway, resolver: None, kv: None, clock: None, settings: Settings::default(), retry: None }
    }

    pub fn id(&self) -> &str { &self.id }
    pub fn settings(&self) -> &Settings { &self.settings }
    pub fn store(&self) -> &Arc<OrderStore> { &self.store }
    pub fn orchestrator(&self) -> &SearchOrchestrator { &self.search }
    pub fn counts(&self) -> &Arc<CustomerCounts> { &self.counts }

    /// Apply a batch with a single snapshot publication.
    pub fn upsert_many(&self, batch: Vec<OrderRecord>) -> Vec<OrdoResult<UpsertOutcome>> {
        let n = batch.len();
        let out: Vec<OrdoResult<UpsertOutcome>> =
            self.store.upsert_many(batch).into_iter().map(|r| r.map_err(OrdoError::from)).collect();
        counter!("session_upserts_total", n as u64);
        debug!(session = %self.id, n, "batch upserted");
        out
    }

    /// Start a coalescing ingest loop feeding this session's collection.
    pub fn ingest(&self) -> IngestHandle {
        let (tx, task) = ordo_store::spawn_ingest(Arc::clone(&self.store), self.settings.queue_cap);
        IngestHandle { tx, cancel: CancelHandle { task: Some(task) } }
    }

    /// Resolve counts for every distinct customer currently in the collection.
    pub async fn precompute_counts(&self) -> usize {
        let mut emails: Vec<String> = self.store.current().items.iter().filter_map(|o| o.email().map(String::from)).collect();
        emails.sort();
        emails.dedup();
        self.counts.precompute(emails).await
    }
}

#[async_trait::async_trait]
impl OrdoApi for Session {
    fn upsert(&self, record: OrderRecord) -> OrdoResult<UpsertOutcome> {
        counter!("session_upserts_total", 1u64);
        Ok(self.store.upsert(record)?)
    }

    fn upsert_raw(&self, raw: &serde_json::Value) -> OrdoResult<UpsertOutcome> {
        let record = OrderRecord::from_raw(raw)?;
        self.upsert(record)
    }

    fn remove(&self, id: &str) -> bool { self.store.remove_by_id(id) }

    fn snapshot(&self) -> Arc<OrderSnapshot> { self.store.current() }

    fn by_status(&self, status: FulfillmentStatus) -> Arc<Vec<OrderRecord>> { self.store.by_status(status) }
    fn unfulfilled(&self) -> Arc<Vec<OrderRecord>> { self.store.unfulfilled() }
    fn by_payment_status(&self, status: PaymentStatus) -> Arc<Vec<OrderRecord>> { self.store.by_payment_status(status) }
    fn summary(&self) -> Arc<OrderSummary> { self.store.summary() }

    async fn search(&self, query: &str, filters: &OrderFilter) -> OrdoResult<SearchOutcome> {
        let t0 = Instant::now();
        let out = self.search.search(query, filters).await;
        info!(query = %query, hits = out.records.len(), cache_hit = out.meta.cache_hit, partial = out.meta.partial, took_ms = %t0.elapsed().as_millis(), "api: search ok");
        Ok(out)
    }

    async fn search_debounced(&self, query: &str, filters: &OrderFilter) -> OrdoResult<SearchOutcome> {
        Ok(self.search.search_debounced(query, filters).await?)
    }

    fn preview(&self, query: &str, filters: &OrderFilter) -> Vec<OrderRecord> { self.search.preview(query, filters) }

    async fn search_status(&self, key: StatusKey) -> OrdoResult<SearchOutcome> {
        let t0 = Instant::now();
        let out = self.search.search_status(key).await;
        info!(status = %key, hits = out.records.len(), has_more = out.has_more(), took_ms = %t0.elapsed().as_millis(), "api: status search ok");
        Ok(out)
    }

    async fn load_more(&self, key: StatusKey) -> OrdoResult<SearchOutcome> { Ok(self.search.load_more(key).await) }

    fn customer_count(&self, email: &str) -> u64 { self.counts.get(email) }

    async fn refresh_customer_count(&self, email: &str) -> u64 { self.counts.refresh(email).await }

    fn stats(&self) -> Stats {
        let snap = self.store.current();
        Stats {
            session_id: self.id.clone(),
            orders: snap.items.len(),
            collection_cap: self.settings.collection_cap,
            epoch: snap.epoch,
            search_cache_entries: self.search.cache_len(),
            searches_executed: self.search.executed(),
            customer_counts: self.counts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::ManualClock;
    use ordo_gateway::{GatewayError, MemoryGateway};

    fn order(id: &str, ts: i64, email: &str) -> OrderRecord {
        OrderRecord::new(id, id, ts, FulfillmentStatus::NotFulfilled).with_customer(Some("Pat"), Some(email))
    }

    fn session(gw: Arc<MemoryGateway>) -> Arc<Session> {
        Session::builder(gw).clock(Arc::new(ManualClock::new(1_000_000))).build()
    }

    #[tokio::test]
    async fn views_follow_upserts() {
        let s = session(Arc::new(MemoryGateway::default()));
        s.upsert(order("a", 1, "a@x.com")).unwrap();
        assert_eq!(s.unfulfilled().len(), 1);
        let mut shipped = order("a", 99, "a@x.com");
        shipped.status = FulfillmentStatus::Fulfilled;
        assert_eq!(s.upsert(shipped).unwrap(), UpsertOutcome::Replaced);
        assert!(s.unfulfilled().is_empty());
        assert_eq!(s.by_status(FulfillmentStatus::Fulfilled)[0].created_at, 1);
        assert!(matches!(s.upsert(order("", 1, "a@x.com")), Err(OrdoError::Validation(_))));
        assert_eq!(s.stats().orders, 1);
    }

    #[tokio::test]
    async fn raw_payloads_are_normalized() {
        let s = session(Arc::new(MemoryGateway::default()));
        let raw = serde_json::json!({ "_id": "x1", "orderNumber": 7, "buyerInfo": { "email": " Pat@X.com " } });
        s.upsert_raw(&raw).unwrap();
        assert_eq!(s.snapshot().items[0].email(), Some("pat@x.com"));
        assert!(s.upsert_raw(&serde_json::json!({ "number": "1" })).is_err());
    }

    #[tokio::test]
    async fn new_orders_invalidate_customer_counts() {
        let gw = Arc::new(MemoryGateway::new(vec![order("r1", 1, "a@x.com")]));
        let s = session(gw.clone());
        s.upsert(order("r1", 1, "a@x.com")).unwrap();
        assert_eq!(s.refresh_customer_count("a@x.com").await, 1);
        // Replacing a known order keeps the count.
        s.upsert(order("r1", 1, "a@x.com")).unwrap();
        assert!(s.counts().status("a@x.com").is_some());
        s.upsert(order("n1", 2, "a@x.com")).unwrap();
        assert!(s.counts().status("a@x.com").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn remote_outage_still_answers_locally() {
        let gw = Arc::new(MemoryGateway::default());
        gw.set_failing(Some(GatewayError::Unavailable("down".into())));
        let s = session(gw.clone());
        s.upsert(order("42", 1, "a@x.com")).unwrap();
        let out = s.search("42", &OrderFilter::default()).await.unwrap();
        assert!(out.meta.partial);
        assert_eq!(out.records.len(), 1);
        // Retried by the resilience policy before giving up.
        assert_eq!(gw.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn ingest_loop_feeds_the_session() {
        let s = session(Arc::new(MemoryGateway::default()));
        let IngestHandle { tx, cancel } = s.ingest();
        tx.send(OrderDelta::Upsert(order("a", 1, "a@x.com"))).await.unwrap();
        tx.send(OrderDelta::Upsert(order("b", 2, "b@x.com"))).await.unwrap();
        tx.send(OrderDelta::Remove("a".into())).await.unwrap();
        drop(tx);
        cancel.join().await;
        let ids: Vec<String> = s.snapshot().items.iter().map(|o| o.id.clone()).collect();
        assert_eq!(ids, vec!["b".to_string()]);
    }
}
