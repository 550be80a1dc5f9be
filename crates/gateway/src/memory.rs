//! In-memory gateway and identity directory.
//!
//! Used as the remote source for the CLI's JSON fixtures and as the stand-in
//! collaborator in tests: calls are counted, filters recorded, latency and
//! failures can be scripted.

use async_trait::async_trait;
use ordo_core::OrderRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::Duration;
use tracing::debug;

use crate::{decode_page, CustomerIdentity, GatewayError, IdentityResolver, OrderGateway, OrderQuery, QueryFilter, QueryPage, SortOrder};

#[derive(Default)]
pub struct MemoryGateway {
    records: RwLock<Vec<OrderRecord>>,
    latency: Duration,
    calls: AtomicUsize,
    filters: Mutex<Vec<QueryFilter>>,
    failures: Mutex<VecDeque<GatewayError>>,
    fail_always: Mutex<Option<GatewayError>>,
}

impl MemoryGateway {
    pub fn new(records: Vec<OrderRecord>) -> Self {
        Self { records: RwLock::new(records), ..Self::default() }
    }

    /// Load raw orders, normalizing each at the boundary. A bare array must
    /// decode completely; a captured page (`{"orders": [...], "metadata": ...}`)
    /// goes through [`decode_page`] and drops records it cannot decode.
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, GatewayError> {
        let Some(arr) = raw.as_array() else {
            return Ok(Self::new(decode_page(raw)?.records));
        };
        let mut records = Vec::with_capacity(arr.len());
        for it in arr {
            records.push(OrderRecord::from_raw(it).map_err(|e| GatewayError::Decode(e.to_string()))?);
        }
        Ok(Self::new(records))
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn insert(&self, record: OrderRecord) {
        if let Ok(mut g) = self.records.write() { g.push(record); }
    }

    pub fn records(&self) -> Vec<OrderRecord> {
        self.records.read().map(|g| g.clone()).unwrap_or_default()
    }

    /// Fail the next call with `err` (queued, one per call).
    pub fn push_failure(&self, err: GatewayError) {
        if let Ok(mut q) = self.failures.lock() { q.push_back(err); }
    }

    /// Fail every call until reset with `None`.
    pub fn set_failing(&self, err: Option<GatewayError>) {
        if let Ok(mut g) = self.fail_always.lock() { *g = err; }
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }

    /// Filters seen so far, in call order.
    pub fn filters(&self) -> Vec<QueryFilter> {
        self.filters.lock().map(|g| g.clone()).unwrap_or_default()
    }

    fn scripted_failure(&self) -> Option<GatewayError> {
        if let Some(e) = self.failures.lock().ok().and_then(|mut q| q.pop_front()) { return Some(e); }
        self.fail_always.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl OrderGateway for MemoryGateway {
    async fn query(&self, query: &OrderQuery) -> Result<QueryPage, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut f) = self.filters.lock() { f.push(query.filter.clone()); }
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if let Some(e) = self.scripted_failure() {
            return Err(e);
        }
        let offset = match query.paging.cursor.as_deref() {
            Some(c) => c.parse::<usize>().map_err(|_| GatewayError::Decode(format!("bad cursor {}", c)))?,
            None => 0,
        };
        let mut matched: Vec<OrderRecord> = self
            .records
            .read()
            .map_err(|_| GatewayError::Unavailable("poisoned".into()))?
            .iter()
            .filter(|o| query.filter.matches(o))
            .cloned()
            .collect();
        match query.sort {
            SortOrder::CreatedDesc => matched.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id))),
            SortOrder::CreatedAsc => matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id))),
        }
        let limit = query.paging.limit.max(1);
        let end = (offset + limit).min(matched.len());
        let records = if offset < matched.len() { matched[offset..end].to_vec() } else { Vec::new() };
        let has_next = end < matched.len();
        debug!(filter = ?query.filter, offset, returned = records.len(), has_next, "memory gateway query");
        Ok(QueryPage { records, has_next, next_cursor: if has_next { Some(end.to_string()) } else { None } })
    }
}

/// Identity directory matching free text against full names.
#[derive(Default)]
pub struct MemoryDirectory {
    identities: Vec<CustomerIdentity>,
    calls: AtomicUsize,
    fail_with: Option<GatewayError>,
}

impl MemoryDirectory {
    pub fn new(identities: Vec<CustomerIdentity>) -> Self { Self { identities, ..Self::default() } }

    pub fn failing(err: GatewayError) -> Self { Self { fail_with: Some(err), ..Self::default() } }

    /// Identities derived from the customers present in `records`, deduplicated.
    pub fn from_records(records: &[OrderRecord]) -> Self {
        let mut out: Vec<CustomerIdentity> = Vec::new();
        for o in records {
            let (first, last) = match o.customer.name.as_deref().map(|n| n.trim()).filter(|n| !n.is_empty()) {
                Some(n) => match n.split_once(' ') {
                    Some((f, l)) => (Some(f.to_string()), Some(l.trim().to_string())),
                    None => (Some(n.to_string()), None),
                },
                None => (None, None),
            };
            let id = CustomerIdentity { first_name: first, last_name: last, email: o.customer.email.clone() };
            if (id.first_name.is_some() || id.email.is_some()) && !out.contains(&id) { out.push(id); }
        }
        Self::new(out)
    }

    pub fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
}

#[async_trait]
impl IdentityResolver for MemoryDirectory {
    async fn resolve_by_name(&self, text: &str) -> Result<Vec<CustomerIdentity>, GatewayError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = &self.fail_with { return Err(e.clone()); }
        let needle = text.trim().to_lowercase();
        if needle.is_empty() { return Ok(Vec::new()); }
        Ok(self
            .identities
            .iter()
            .filter(|id| id.full_name().map(|n| n.to_lowercase().contains(&needle)).unwrap_or(false))
            .cloned()
            .collect())
    }
}
