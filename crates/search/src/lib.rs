//! Ordo search: answers free-text and status queries by combining a scan of
//! the in-memory collection with one authoritative remote page, merging the
//! two and caching the result for a short TTL.
//!
//! Refinements of the previous query (same filters, longer text that starts
//! with the old one) scan the previous result set instead of the whole
//! collection. The remote stage still runs: a longer query can change its shape,
//! e.g. from a name prefix to an exact email.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use ordo_core::{Clock, Millis, OrderFilter, OrderRecord, Settings, StatusKey};
use ordo_gateway::{IdentityResolver, OrderGateway, OrderQuery, QueryFilter};
use ordo_store::OrderStore;
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

pub mod cache;
pub mod debounce;
pub mod local;
pub mod remote;

pub use cache::{CacheEntry, ResultCache};
pub use debounce::Debouncer;
pub use local::{local_scan, match_field, merge, MatchField};
pub use remote::{build_remote_filter, classify, with_filters, QueryKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    pub ttl_ms: Millis,
    pub cache_cap: usize,
    pub debounce: Duration,
    /// Records requested from the remote stage per page.
    pub page_size: usize,
}

impl Default for SearchConfig {
    fn default() -> Self { Self::from_settings(&Settings::default()) }
}

impl SearchConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            ttl_ms: s.search_ttl_ms as Millis,
            cache_cap: s.search_cache_cap.max(1),
            debounce: s.debounce(),
            page_size: s.search_page_size.max(1),
        }
    }
}

/// How an outcome was produced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchMeta {
    pub cache_hit: bool,
    pub incremental: bool,
    /// The remote stage failed; records are local only.
    pub partial: bool,
    pub remote_queried: bool,
    pub local: usize,
    pub remote: usize,
    pub merged: usize,
}

#[derive(Debug, Clone)]
pub struct SearchOutcome {
    /// Newest first.
    pub records: Arc<Vec<OrderRecord>>,
    pub meta: SearchMeta,
    pub next_cursor: Option<String>,
}

impl SearchOutcome {
    pub fn has_more(&self) -> bool { self.next_cursor.is_some() }
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum SearchError {
    #[error("superseded by a newer search")]
    Superseded,
}

struct LastQuery {
    query: String,
    filters: OrderFilter,
    records: Arc<Vec<OrderRecord>>,
}

/// Accumulated status results and the remote cursor for the next page.
struct StatusPages {
    records: Arc<Vec<OrderRecord>>,
    cursor: Option<String>,
}

/// Trim and lowercase.
pub fn normalize_query(q: &str) -> String { q.trim().to_lowercase() }

fn text_key(q: &str, filters: &OrderFilter) -> String { format!("text:{}|{}", q, filters.signature()) }

fn status_key(key: &StatusKey) -> String { format!("status:{}", key) }

pub struct SearchOrchestrator {
    store: Arc<OrderStore>,
    gateway: Arc<dyn OrderGateway>,
    resolver: Option<Arc<dyn IdentityResolver>>,
    clock: Arc<dyn Clock>,
    cfg: SearchConfig,
    cache: Mutex<ResultCache>,
    last: Mutex<Option<LastQuery>>,
    status_pages: Mutex<FxHashMap<StatusKey, StatusPages>>,
    debouncer: Debouncer,
    executed: AtomicU64,
}

impl SearchOrchestrator {
    pub fn new(store: Arc<OrderStore>, gateway: Arc<dyn OrderGateway>, clock: Arc<dyn Clock>, cfg: SearchConfig) -> Self {
        Self {
            cache: Mutex::new(ResultCache::new(cfg.ttl_ms, cfg.cache_cap)),
            debouncer: Debouncer::new(cfg.debounce),
            store,
            gateway,
            resolver: None,
            clock,
            cfg,
            last: Mutex::new(None),
            status_pages: Mutex::new(FxHashMap::default()),
            executed: AtomicU64::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn IdentityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &SearchConfig { &self.cfg }

    /// Searches that missed the cache and actually ran.
    pub fn executed(&self) -> u64 { self.executed.load(Ordering::Relaxed) }

    pub fn cache_len(&self) -> usize { self.cache().len() }

    fn cache(&self) -> MutexGuard<'_, ResultCache> { self.cache.lock().unwrap_or_else(|e| e.into_inner()) }
    fn last(&self) -> MutexGuard<'_, Option<LastQuery>> { self.last.lock().unwrap_or_else(|e| e.into_inner()) }
    fn pages(&self) -> MutexGuard<'_, FxHashMap<StatusKey, StatusPages>> {
        self.status_pages.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn cached(&self, key: &str) -> Option<SearchOutcome> {
        let now = self.clock.now_ms();
        let cache = self.cache();
        let e = cache.get(key, now)?;
        Some(SearchOutcome {
            records: Arc::clone(&e.records),
            meta: SearchMeta { cache_hit: true, ..e.meta.clone() },
            next_cursor: e.next_cursor.clone(),
        })
    }

    fn store_result(&self, key: String, out: &SearchOutcome) {
        if out.meta.partial {
            debug!(%key, "partial result not cached");
            return;
        }
        let entry = CacheEntry {
            records: Arc::clone(&out.records),
            meta: out.meta.clone(),
            next_cursor: out.next_cursor.clone(),
            computed_at: self.clock.now_ms(),
        };
        self.cache().insert(key, entry);
    }

    /// Partial outcomes are local-only and never serve as a refinement base.
    fn remember(&self, q: &str, filters: &OrderFilter, out: &SearchOutcome) {
        if q.is_empty() { return; }
        let mut last = self.last();
        if out.meta.partial {
            *last = None;
            return;
        }
        *last = Some(LastQuery { query: q.to_string(), filters: filters.clone(), records: Arc::clone(&out.records) });
    }

    fn refinement_base(&self, q: &str, filters: &OrderFilter) -> Option<Arc<Vec<OrderRecord>>> {
        if q.is_empty() { return None; }
        let last = self.last();
        let prev = last.as_ref()?;
        // Strict extension only; repeating a query goes through the cache or a full run.
        if prev.filters != *filters || q.len() <= prev.query.len() || !q.starts_with(prev.query.as_str()) {
            return None;
        }
        Some(Arc::clone(&prev.records))
    }

    /// One remote page. Failures degrade to an empty page flagged `partial`.
    async fn remote_page(&self, filter: QueryFilter, cursor: Option<String>, meta: &mut SearchMeta) -> (Vec<OrderRecord>, Option<String>) {
        meta.remote_queried = true;
        let query = OrderQuery::first_page(filter, self.cfg.page_size).after(cursor);
        match self.gateway.query(&query).await {
            Ok(page) => {
                meta.remote = page.records.len();
                let next = if page.has_next { page.next_cursor } else { None };
                (page.records, next)
            }
            Err(e) => {
                meta.partial = true;
                counter!("search_remote_failures_total", 1u64, "kind" => e.kind());
                warn!(error = %e, filter = ?query.filter, "remote search failed; returning local results");
                (Vec::new(), None)
            }
        }
    }

    /// Free-text search constrained by `filters`.
    pub async fn search(&self, query: &str, filters: &OrderFilter) -> SearchOutcome {
        let started = Instant::now();
        let q = normalize_query(query);
        let key = text_key(&q, filters);
        if let Some(hit) = self.cached(&key) {
            counter!("search_cache_hits_total", 1u64);
            self.remember(&q, filters, &hit);
            return hit;
        }
        counter!("search_cache_misses_total", 1u64);
        self.executed.fetch_add(1, Ordering::Relaxed);

        let mut meta = SearchMeta::default();
        let local = match self.refinement_base(&q, filters) {
            Some(prev) => {
                meta.incremental = true;
                local_scan(prev.iter(), &q, filters)
            }
            None => {
                let snap = self.store.current();
                local_scan(snap.items.iter(), &q, filters)
            }
        };
        meta.local = local.len();
        let remote = match build_remote_filter(&q, self.resolver.as_deref()).await {
            Some(f) => {
                let (mut recs, _) = self.remote_page(with_filters(f, filters), None, &mut meta).await;
                recs.retain(|o| filters.matches(o));
                recs
            }
            None => Vec::new(),
        };
        let merged = merge(local, remote);
        meta.merged = merged.len();
        let out = SearchOutcome { records: Arc::new(merged), meta, next_cursor: None };
        self.store_result(key, &out);
        self.remember(&q, filters, &out);
        histogram!("search_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => "text");
        debug!(query = %q, local = out.meta.local, remote = out.meta.remote, merged = out.meta.merged,
            incremental = out.meta.incremental, partial = out.meta.partial, "search resolved");
        out
    }

    /// Debounced [`search`](Self::search): a newer call within the window
    /// cancels this one before anything runs.
    pub async fn search_debounced(&self, query: &str, filters: &OrderFilter) -> Result<SearchOutcome, SearchError> {
        if !self.debouncer.settle().await {
            counter!("search_debounce_superseded_total", 1u64);
            return Err(SearchError::Superseded);
        }
        Ok(self.search(query, filters).await)
    }

    /// Local-only matches for immediate display; no cache, no remote call.
    pub fn preview(&self, query: &str, filters: &OrderFilter) -> Vec<OrderRecord> {
        let q = normalize_query(query);
        let snap = self.store.current();
        local_scan(snap.items.iter(), &q, filters)
    }

    /// All orders with the given fulfillment or payment status.
    pub async fn search_status(&self, key: StatusKey) -> SearchOutcome {
        let started = Instant::now();
        let ckey = status_key(&key);
        if let Some(hit) = self.cached(&ckey) {
            counter!("search_cache_hits_total", 1u64);
            self.pages().insert(key, StatusPages { records: Arc::clone(&hit.records), cursor: hit.next_cursor.clone() });
            return hit;
        }
        counter!("search_cache_misses_total", 1u64);
        self.executed.fetch_add(1, Ordering::Relaxed);

        let mut meta = SearchMeta::default();
        let local: Vec<OrderRecord> = {
            let snap = self.store.current();
            snap.items.iter().filter(|o| key.matches(o)).cloned().collect()
        };
        meta.local = local.len();
        let (mut remote, next_cursor) = self.remote_page(QueryFilter::Status(key), None, &mut meta).await;
        remote.retain(|o| key.matches(o));
        let merged = merge(local, remote);
        meta.merged = merged.len();
        let out = SearchOutcome { records: Arc::new(merged), meta, next_cursor };
        self.store_result(ckey, &out);
        self.pages().insert(key, StatusPages { records: Arc::clone(&out.records), cursor: out.next_cursor.clone() });
        histogram!("search_ms", started.elapsed().as_secs_f64() * 1000.0, "kind" => "status");
        debug!(status = %key, merged = out.meta.merged, has_more = out.has_more(), "status search resolved");
        out
    }

    /// Fetch the next remote page for `key` and merge it into the accumulated
    /// results. Runs a fresh status search when nothing is accumulated yet.
    pub async fn load_more(&self, key: StatusKey) -> SearchOutcome {
        let prior = self.pages().get(&key).map(|p| (Arc::clone(&p.records), p.cursor.clone()));
        let Some((records, cursor)) = prior else { return self.search_status(key).await };
        let mut meta = SearchMeta { local: records.len(), ..SearchMeta::default() };
        let Some(cursor) = cursor else {
            meta.merged = records.len();
            return SearchOutcome { records, meta, next_cursor: None };
        };
        let (mut remote, next) = self.remote_page(QueryFilter::Status(key), Some(cursor.clone()), &mut meta).await;
        if meta.partial {
            // Keep the cursor so the caller can retry.
            meta.merged = records.len();
            return SearchOutcome { records, meta, next_cursor: Some(cursor) };
        }
        remote.retain(|o| key.matches(o));
        let merged = merge(records.to_vec(), remote);
        meta.merged = merged.len();
        let out = SearchOutcome { records: Arc::new(merged), meta, next_cursor: next };
        self.store_result(status_key(&key), &out);
        self.pages().insert(key, StatusPages { records: Arc::clone(&out.records), cursor: out.next_cursor.clone() });
        debug!(status = %key, merged = out.meta.merged, has_more = out.has_more(), "loaded more status results");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::{FulfillmentStatus, ManualClock, PaymentStatus};
    use ordo_gateway::{GatewayError, MemoryGateway};

    fn rec(id: &str, number: &str, ts: i64, name: &str) -> OrderRecord {
        OrderRecord::new(id, number, ts, FulfillmentStatus::NotFulfilled).with_customer(Some(name), None)
    }

    fn setup(local: Vec<OrderRecord>, remote: Vec<OrderRecord>) -> (SearchOrchestrator, Arc<MemoryGateway>, ManualClock) {
        setup_with(SearchConfig::default(), local, remote)
    }

    fn setup_with(cfg: SearchConfig, local: Vec<OrderRecord>, remote: Vec<OrderRecord>) -> (SearchOrchestrator, Arc<MemoryGateway>, ManualClock) {
        let store = Arc::new(OrderStore::new(100));
        store.upsert_many(local);
        let gw = Arc::new(MemoryGateway::new(remote));
        let clock = ManualClock::new(1_000_000);
        let s = SearchOrchestrator::new(store, gw.clone(), Arc::new(clock.clone()), cfg);
        (s, gw, clock)
    }

    #[tokio::test]
    async fn numeric_query_merges_local_and_remote() {
        let (s, gw, _) = setup(
            vec![rec("a", "1001", 10, "Local Ann")],
            vec![rec("a", "1001", 10, "Remote Ann"), rec("b", "1001", 20, "Other")],
        );
        let out = s.search(" 1001 ", &OrderFilter::default()).await;
        assert_eq!(out.records.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["b", "a"]);
        assert_eq!(out.records[1].customer.name.as_deref(), Some("Local Ann"));
        assert_eq!(out.meta, SearchMeta { remote_queried: true, local: 1, remote: 2, merged: 2, ..SearchMeta::default() });
        assert_eq!(gw.filters(), vec![QueryFilter::NumberEq("1001".into())]);
    }

    #[tokio::test]
    async fn ttl_boundary() {
        let (s, gw, clock) = setup(vec![rec("a", "1", 1, "x")], Vec::new());
        let f = OrderFilter::default();
        s.search("1", &f).await;
        clock.advance(29_999);
        assert!(s.search("1", &f).await.meta.cache_hit);
        assert_eq!(gw.calls(), 1);
        clock.advance(1);
        assert!(!s.search("1", &f).await.meta.cache_hit);
        assert_eq!(gw.calls(), 2);
        assert_eq!(s.executed(), 2);
    }

    #[tokio::test]
    async fn remote_failure_degrades_to_local_and_is_not_cached() {
        let (s, gw, _) = setup(vec![rec("a", "7", 1, "x")], Vec::new());
        gw.set_failing(Some(GatewayError::Unavailable("down".into())));
        let out = s.search("7", &OrderFilter::default()).await;
        assert!(out.meta.partial);
        assert_eq!(out.records.len(), 1);
        assert_eq!(s.cache_len(), 0);
        gw.set_failing(None);
        assert!(!s.search("7", &OrderFilter::default()).await.meta.partial);
        assert_eq!(s.cache_len(), 1);
    }

    #[tokio::test]
    async fn outage_result_is_not_a_refinement_base() {
        let (s, gw, _) = setup(vec![rec("a", "1002", 1, "x")], vec![rec("r", "10019", 5, "remote")]);
        let f = OrderFilter::default();
        gw.set_failing(Some(GatewayError::Unavailable("down".into())));
        assert!(s.search("100", &f).await.meta.partial);
        gw.set_failing(None);

        let out = s.search("10019", &f).await;
        assert!(!out.meta.incremental);
        assert!(!out.meta.partial);
        assert_eq!(out.records.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["r"]);
        assert!(s.search("10019", &f).await.meta.cache_hit);
        assert_eq!(s.search("10019", &f).await.records.len(), 1);
    }

    #[tokio::test]
    async fn free_text_without_resolver_stays_local() {
        let (s, gw, _) = setup(vec![rec("a", "1", 1, "John"), rec("b", "2", 2, "Ann")], Vec::new());
        let out = s.search("JOHN", &OrderFilter::default()).await;
        assert_eq!(out.records.len(), 1);
        assert!(!out.meta.remote_queried);
        assert_eq!(gw.calls(), 0);
    }

    #[tokio::test]
    async fn status_search_pages_with_load_more() {
        let paid = |id: &str, ts: i64| {
            let mut o = rec(id, id, ts, "p");
            o.payment_status = PaymentStatus::Paid;
            o
        };
        let remote: Vec<OrderRecord> = (0..5).map(|i| paid(&format!("r{}", i), i)).collect();
        let cfg = SearchConfig { page_size: 2, ..SearchConfig::default() };
        let (s, gw, _) = setup_with(cfg, vec![paid("l", 100), rec("u", "u", 50, "unpaid")], remote);
        let key = StatusKey::Payment(PaymentStatus::Paid);

        let first = s.search_status(key).await;
        assert_eq!(first.records.iter().map(|o| o.id.as_str()).collect::<Vec<_>>(), vec!["l", "r4", "r3"]);
        assert!(first.has_more());
        let second = s.load_more(key).await;
        assert_eq!(second.records.len(), 5);
        let third = s.load_more(key).await;
        assert_eq!(third.records.len(), 6);
        assert!(!third.has_more());
        let done = s.load_more(key).await;
        assert_eq!(done.records.len(), 6);
        assert_eq!(gw.calls(), 3);
        // The accumulated set is what a cached status search now returns.
        assert_eq!(s.search_status(key).await.records.len(), 6);
    }
}
