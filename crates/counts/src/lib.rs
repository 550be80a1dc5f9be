//! Ordo customer counts: how many orders each customer has placed, resolved in
//! the background against the remote gateway and kept across restarts.
//!
//! Lookups never block. A miss (or a stale entry) returns whatever is cached,
//! `0` when nothing is, and starts at most one resolution per email. Completed
//! resolutions are persisted as a flat JSON map under [`PERSIST_KEY`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};
use ordo_core::{normalize_email, Clock, Millis, OrderRecord, Settings};
use ordo_gateway::{GatewayError, OrderGateway, OrderQuery, QueryFilter};
use ordo_persist::KvStore;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const PERSIST_KEY: &str = "customer_order_counts";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountConfig {
    pub ttl_ms: Millis,
    pub capacity: usize,
    pub page_size: usize,
    pub max_pages: usize,
    pub page_delay: Duration,
    pub customer_delay: Duration,
}

impl Default for CountConfig {
    fn default() -> Self { Self::from_settings(&Settings::default()) }
}

impl CountConfig {
    pub fn from_settings(s: &Settings) -> Self {
        Self {
            ttl_ms: s.count_ttl().as_millis() as Millis,
            capacity: s.count_cap.max(1),
            page_size: s.count_page_size.max(1),
            max_pages: s.count_max_pages.max(1),
            page_delay: s.count_page_delay(),
            customer_delay: s.count_customer_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Idle,
    /// Resolution running; the ticket identifies it so a superseded run
    /// cannot overwrite a newer one.
    InFlight(u64),
}

#[derive(Debug, Clone, Copy)]
struct CountEntry {
    count: u64,
    /// Epoch ms of the last resolution; `0` for a placeholder never resolved.
    ts: Millis,
    state: EntryState,
}

/// Read-only view of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountStatus {
    pub count: u64,
    pub resolved_at: Option<Millis>,
    pub in_flight: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedCount {
    count: u64,
    timestamp: Millis,
}

struct Resolution {
    count: u64,
    pages: usize,
    error: Option<GatewayError>,
}

pub struct CustomerCounts {
    entries: Mutex<FxHashMap<String, CountEntry>>,
    tickets: AtomicU64,
    /// Sequence of serialized snapshots, assigned under the `entries` lock.
    snapshots: AtomicU64,
    /// Sequence of the last snapshot written; writes of older ones are dropped.
    persisted: Arc<Mutex<u64>>,
    gateway: Arc<dyn OrderGateway>,
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    cfg: CountConfig,
}

impl CustomerCounts {
    pub fn new(gateway: Arc<dyn OrderGateway>, kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, cfg: CountConfig) -> Self {
        Self {
            entries: Mutex::new(FxHashMap::default()),
            tickets: AtomicU64::new(1),
            snapshots: AtomicU64::new(0),
            persisted: Arc::new(Mutex::new(0)),
            gateway,
            kv,
            clock,
            cfg,
        }
    }

    /// Construct and load persisted counts. A failed load leaves the cache empty.
    pub fn open(gateway: Arc<dyn OrderGateway>, kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, cfg: CountConfig) -> Arc<Self> {
        let me = Arc::new(Self::new(gateway, kv, clock, cfg));
        if let Err(e) = me.load() {
            warn!(error = %e, "customer counts not loaded; starting empty");
        }
        me
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<String, CountEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_fresh(&self, e: &CountEntry, now: Millis) -> bool {
        e.ts > 0 && now.saturating_sub(e.ts) < self.cfg.ttl_ms
    }

    /// Replace the in-memory map with the persisted one, dropping expired entries.
    /// Returns how many entries were kept.
    pub fn load(&self) -> anyhow::Result<usize> {
        let Some(bytes) = self.kv.read(PERSIST_KEY)? else { return Ok(0) };
        let parsed: FxHashMap<String, PersistedCount> = match serde_json::from_slice(&bytes) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, bytes = bytes.len(), "discarding corrupt customer count payload");
                counter!("count_load_corrupt_total", 1u64);
                self.lock().clear();
                self.kv.delete(PERSIST_KEY)?;
                return Ok(0);
            }
        };
        let now = self.clock.now_ms();
        let total = parsed.len();
        let mut map = self.lock();
        map.clear();
        for (email, p) in parsed {
            let e = CountEntry { count: p.count, ts: p.timestamp, state: EntryState::Idle };
            if self.is_fresh(&e, now) {
                map.insert(normalize_email(&email), e);
            }
        }
        self.evict_overflow(&mut map);
        let kept = map.len();
        gauge!("count_cache_size", kept as f64);
        info!(kept, pruned = total.saturating_sub(kept), "customer counts loaded");
        Ok(kept)
    }

    /// Cached count for `email`, starting a background resolution when the entry
    /// is missing or stale and none is running. Never waits on the gateway.
    pub fn get(self: &Arc<Self>, email: &str) -> u64 {
        let email = normalize_email(email);
        if email.is_empty() { return 0; }
        let (count, ticket) = match self.claim(&email) {
            Claim::Ready(c) => {
                counter!("count_cache_hits_total", 1u64);
                return c;
            }
            Claim::Busy(c) => return c,
            Claim::Start { count, ticket } => (count, ticket),
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let me = Arc::clone(self);
                rt.spawn(async move { me.run(email, ticket).await; });
            }
            Err(_) => {
                warn!(%email, "no runtime; count resolution not started");
                self.abandon(&email, ticket);
            }
        }
        count
    }

    /// Resolve `email` now and return the resulting count. Joins nothing: if a
    /// resolution is already running the cached value is returned as-is.
    pub async fn refresh(&self, email: &str) -> u64 {
        let email = normalize_email(email);
        if email.is_empty() { return 0; }
        match self.claim_forced(&email) {
            Claim::Start { ticket, .. } => self.run(email, ticket).await,
            Claim::Ready(c) | Claim::Busy(c) => c,
        }
    }

    /// Resolve every stale or unknown email in turn, pausing between customers.
    pub async fn precompute<I, S>(&self, emails: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut resolved = 0usize;
        for email in emails {
            let email = normalize_email(email.as_ref());
            if email.is_empty() { continue; }
            let ticket = match self.claim(&email) {
                Claim::Start { ticket, .. } => ticket,
                Claim::Ready(_) | Claim::Busy(_) => continue,
            };
            if resolved > 0 && !self.cfg.customer_delay.is_zero() {
                tokio::time::sleep(self.cfg.customer_delay).await;
            }
            self.run(email, ticket).await;
            resolved += 1;
        }
        debug!(resolved, "customer count precompute finished");
        resolved
    }

    pub fn invalidate(&self, email: &str) {
        let email = normalize_email(email);
        if self.lock().remove(&email).is_some() {
            debug!(%email, "customer count invalidated");
        }
    }

    /// A new order for this customer makes the cached count stale.
    pub fn observe_order(&self, record: &OrderRecord) {
        if let Some(email) = record.email() { self.invalidate(email); }
    }

    pub fn status(&self, email: &str) -> Option<CountStatus> {
        self.lock().get(&normalize_email(email)).map(|e| CountStatus {
            count: e.count,
            resolved_at: (e.ts > 0).then_some(e.ts),
            in_flight: matches!(e.state, EntryState::InFlight(_)),
        })
    }

    pub fn len(&self) -> usize { self.lock().len() }
    pub fn is_empty(&self) -> bool { self.lock().is_empty() }

    fn claim(&self, email: &str) -> Claim {
        let now = self.clock.now_ms();
        let mut map = self.lock();
        if let Some(e) = map.get(email) {
            if let EntryState::InFlight(_) = e.state { return Claim::Busy(e.count); }
            if self.is_fresh(e, now) { return Claim::Ready(e.count); }
        }
        self.start(&mut map, email)
    }

    fn claim_forced(&self, email: &str) -> Claim {
        let mut map = self.lock();
        if let Some(e) = map.get(email) {
            if let EntryState::InFlight(_) = e.state { return Claim::Busy(e.count); }
        }
        self.start(&mut map, email)
    }

    fn start(&self, map: &mut FxHashMap<String, CountEntry>, email: &str) -> Claim {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let entry = map
            .entry(email.to_string())
            .or_insert(CountEntry { count: 0, ts: 0, state: EntryState::Idle });
        entry.state = EntryState::InFlight(ticket);
        Claim::Start { count: entry.count, ticket }
    }

    // Undo a claim that produced nothing: placeholders go away, stale entries stay
    // stale so the next lookup retries.
    fn abandon(&self, email: &str, ticket: u64) {
        let mut map = self.lock();
        let Some(e) = map.get_mut(email) else { return };
        if e.state != EntryState::InFlight(ticket) { return; }
        if e.ts == 0 { map.remove(email); } else { e.state = EntryState::Idle; }
    }

    async fn run(&self, email: String, ticket: u64) -> u64 {
        let started = Instant::now();
        let res = self.resolve(&email).await;
        histogram!("count_resolution_ms", started.elapsed().as_secs_f64() * 1000.0);
        match (&res.error, res.pages) {
            (None, _) => counter!("count_resolutions_total", 1u64, "outcome" => "ok"),
            (Some(e), 0) => {
                counter!("count_resolutions_total", 1u64, "outcome" => "failed");
                warn!(%email, error = %e, "customer count resolution failed");
                self.abandon(&email, ticket);
                return self.status(&email).map(|s| s.count).unwrap_or(0);
            }
            (Some(e), pages) => {
                counter!("count_resolutions_total", 1u64, "outcome" => "partial");
                warn!(%email, error = %e, pages, count = res.count, "customer count resolution stopped early; keeping partial count");
            }
        }
        let snapshot = {
            let mut map = self.lock();
            match map.get_mut(&email) {
                Some(e) if e.state == EntryState::InFlight(ticket) => {
                    e.count = res.count;
                    e.ts = self.clock.now_ms();
                    e.state = EntryState::Idle;
                }
                // Invalidated or superseded while running.
                _ => {
                    debug!(%email, "discarding count from superseded resolution");
                    return res.count;
                }
            }
            self.evict_overflow(&mut map);
            gauge!("count_cache_size", map.len() as f64);
            let seq = self.snapshots.fetch_add(1, Ordering::Relaxed) + 1;
            Self::serialize(&map).map(|bytes| (seq, bytes))
        };
        match snapshot {
            Ok((seq, bytes)) => self.persist(seq, bytes).await,
            Err(e) => warn!(error = %e, "failed to serialize customer counts"),
        }
        res.count
    }

    async fn resolve(&self, email: &str) -> Resolution {
        let query = OrderQuery::first_page(QueryFilter::EmailEq(email.to_string()), self.cfg.page_size);
        let mut cursor: Option<String> = None;
        let mut out = Resolution { count: 0, pages: 0, error: None };
        loop {
            if out.pages > 0 && !self.cfg.page_delay.is_zero() {
                tokio::time::sleep(self.cfg.page_delay).await;
            }
            match self.gateway.query(&query.after(cursor.take())).await {
                Ok(page) => {
                    out.pages += 1;
                    out.count += page.records.len() as u64;
                    match page.next_cursor {
                        Some(next) if page.has_next => cursor = Some(next),
                        _ => break,
                    }
                    if out.pages >= self.cfg.max_pages {
                        warn!(%email, pages = out.pages, "page cap reached; count may be low");
                        break;
                    }
                }
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            }
        }
        debug!(%email, count = out.count, pages = out.pages, "customer count resolved");
        out
    }

    fn evict_overflow(&self, map: &mut FxHashMap<String, CountEntry>) {
        if map.len() <= self.cfg.capacity { return; }
        let n = ((map.len() as f64) * 0.2).ceil().max(1.0) as usize;
        let mut idle: Vec<(Millis, String)> = map
            .iter()
            .filter(|(_, e)| e.state == EntryState::Idle)
            .map(|(k, e)| (e.ts, k.clone()))
            .collect();
        idle.sort();
        let mut evicted = 0usize;
        for (_, k) in idle.into_iter().take(n) {
            map.remove(&k);
            evicted += 1;
        }
        counter!("count_evictions_total", evicted as u64);
        debug!(evicted, remaining = map.len(), "customer counts evicted");
    }

    fn serialize(map: &FxHashMap<String, CountEntry>) -> Result<Vec<u8>, serde_json::Error> {
        let out: FxHashMap<&str, PersistedCount> = map
            .iter()
            .filter(|(_, e)| e.state == EntryState::Idle && e.ts > 0)
            .map(|(k, e)| (k.as_str(), PersistedCount { count: e.count, timestamp: e.ts }))
            .collect();
        serde_json::to_vec(&out)
    }

    // Writes land in snapshot order: the `persisted` guard is held across the
    // write, and a snapshot older than the last one written is dropped.
    async fn persist(&self, seq: u64, bytes: Vec<u8>) {
        let kv = Arc::clone(&self.kv);
        let persisted = Arc::clone(&self.persisted);
        let write = move || -> anyhow::Result<bool> {
            let mut last = persisted.lock().unwrap_or_else(|e| e.into_inner());
            if seq <= *last { return Ok(false); }
            kv.write(PERSIST_KEY, &bytes)?;
            *last = seq;
            Ok(true)
        };
        let res = match tokio::task::spawn_blocking(write).await {
            Ok(r) => r,
            Err(e) => Err(anyhow::anyhow!("persist task failed: {}", e)),
        };
        match res {
            Ok(true) => {}
            Ok(false) => {
                counter!("count_persist_superseded_total", 1u64);
                debug!(seq, "newer customer count snapshot already persisted");
            }
            Err(e) => {
                counter!("count_persist_failures_total", 1u64);
                warn!(error = %e, "failed to persist customer counts");
            }
        }
    }
}

enum Claim {
    Ready(u64),
    Busy(u64),
    Start { count: u64, ticket: u64 },
}
