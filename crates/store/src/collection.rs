//! Deduplicated, newest-first, capacity-bounded order collection with
//! signature-memoized derived views.

use metrics::counter;
use ordo_core::{FulfillmentStatus, OrderId, OrderRecord, PaymentStatus, RecordError};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New id, prepended. Carries the id evicted to stay within capacity, if any.
    Inserted { evicted: Option<OrderId> },
    /// Existing id, replaced in place.
    Replaced,
}

/// Memoized list projections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListView {
    Status(FulfillmentStatus),
    Unfulfilled,
    Payment(PaymentStatus),
}

impl ListView {
    fn name(&self) -> &'static str {
        match self {
            ListView::Status(_) => "status",
            ListView::Unfulfilled => "unfulfilled",
            ListView::Payment(_) => "payment",
        }
    }

    fn accepts(&self, o: &OrderRecord) -> bool {
        match self {
            ListView::Status(s) => o.status == *s,
            ListView::Unfulfilled => o.status.is_open(),
            ListView::Payment(p) => o.payment_status == *p,
        }
    }
}

/// Aggregate over the whole collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OrderSummary {
    pub total: usize,
    pub by_status: BTreeMap<FulfillmentStatus, usize>,
    pub by_payment: BTreeMap<PaymentStatus, usize>,
    /// Sum of totals per currency, canceled orders excluded.
    pub revenue: BTreeMap<String, f64>,
}

#[derive(Default)]
struct Memo {
    lists: FxHashMap<ListView, (u64, Arc<Vec<OrderRecord>>)>,
    summary: Option<(u64, Arc<OrderSummary>)>,
}

pub struct OrderCollection {
    items: VecDeque<OrderRecord>,
    ids: FxHashSet<OrderId>,
    cap: usize,
    evicted: u64,
    memo: Mutex<Memo>,
}

impl OrderCollection {
    pub fn with_capacity(cap: usize) -> Self {
        let cap = cap.max(1);
        Self {
            items: VecDeque::with_capacity(cap),
            ids: FxHashSet::default(),
            cap,
            evicted: 0,
            memo: Mutex::new(Memo::default()),
        }
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn capacity(&self) -> usize { self.cap }
    pub fn evicted(&self) -> u64 { self.evicted }
    pub fn contains(&self, id: &str) -> bool { self.ids.contains(id) }
    pub fn get(&self, id: &str) -> Option<&OrderRecord> { self.items.iter().find(|o| o.id == id) }
    pub fn iter(&self) -> impl Iterator<Item = &OrderRecord> { self.items.iter() }
    pub fn ids_len(&self) -> usize { self.ids.len() }

    /// Newest first.
    pub fn to_vec(&self) -> Vec<OrderRecord> { self.items.iter().cloned().collect() }

    /// Insert or replace by id. Replacement keeps position and the stored `created_at`.
    pub fn upsert(&mut self, record: OrderRecord) -> Result<UpsertOutcome, RecordError> {
        if record.id.trim().is_empty() {
            counter!("collection_rejected_total", 1u64);
            return Err(RecordError::MalformedRecord("missing id".into()));
        }
        if self.ids.contains(&record.id) {
            // Membership says present; linear scan is bounded by capacity.
            if let Some(slot) = self.items.iter_mut().find(|o| o.id == record.id) {
                let created_at = slot.created_at;
                *slot = record;
                slot.created_at = created_at;
            }
            return Ok(UpsertOutcome::Replaced);
        }
        self.ids.insert(record.id.clone());
        self.items.push_front(record);
        let mut evicted = None;
        while self.items.len() > self.cap {
            if let Some(old) = self.items.pop_back() {
                self.ids.remove(&old.id);
                self.evicted += 1;
                counter!("collection_evicted_total", 1u64);
                debug!(id = %old.id, cap = self.cap, "evicted oldest order");
                evicted = Some(old.id);
            }
        }
        Ok(UpsertOutcome::Inserted { evicted })
    }

    /// Returns whether something was removed.
    pub fn remove_by_id(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.items.retain(|o| o.id != id);
        true
    }

    /// Structural signature: length plus an FNV-1a digest over every field a
    /// derived view reads (id, status, payment status, total).
    pub fn signature(&self) -> u64 {
        let mut h: u64 = 0xcbf29ce484222325;
        let mut feed = |bytes: &[u8]| {
            for b in bytes { h ^= *b as u64; h = h.wrapping_mul(0x100000001b3); }
        };
        feed(&(self.items.len() as u64).to_le_bytes());
        for o in self.items.iter() {
            feed(o.id.as_bytes());
            feed(b":");
            feed(o.status.as_str().as_bytes());
            feed(b"/");
            feed(o.payment_status.as_str().as_bytes());
            feed(&o.total.amount.to_bits().to_le_bytes());
            feed(o.total.currency.as_bytes());
            feed(b";");
        }
        h
    }

    fn memo(&self) -> MutexGuard<'_, Memo> {
        self.memo.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Memoized list view, newest first.
    pub fn view(&self, view: ListView) -> Arc<Vec<OrderRecord>> {
        let sig = self.signature();
        let mut memo = self.memo();
        if let Some((s, v)) = memo.lists.get(&view) {
            if *s == sig {
                counter!("view_memo_hits_total", 1u64, "view" => view.name());
                return Arc::clone(v);
            }
        }
        let out: Arc<Vec<OrderRecord>> = Arc::new(self.items.iter().filter(|o| view.accepts(o)).cloned().collect());
        counter!("view_recompute_total", 1u64, "view" => view.name());
        memo.lists.insert(view, (sig, Arc::clone(&out)));
        out
    }

    pub fn by_status(&self, status: FulfillmentStatus) -> Arc<Vec<OrderRecord>> { self.view(ListView::Status(status)) }
    pub fn unfulfilled(&self) -> Arc<Vec<OrderRecord>> { self.view(ListView::Unfulfilled) }
    pub fn by_payment_status(&self, p: PaymentStatus) -> Arc<Vec<OrderRecord>> { self.view(ListView::Payment(p)) }

    pub fn summary(&self) -> Arc<OrderSummary> {
        let sig = self.signature();
        let mut memo = self.memo();
        if let Some((s, v)) = memo.summary.as_ref() {
            if *s == sig {
                counter!("view_memo_hits_total", 1u64, "view" => "summary");
                return Arc::clone(v);
            }
        }
        let mut sum = OrderSummary { total: self.items.len(), ..OrderSummary::default() };
        for o in self.items.iter() {
            *sum.by_status.entry(o.status).or_default() += 1;
            *sum.by_payment.entry(o.payment_status).or_default() += 1;
            if o.status != FulfillmentStatus::Canceled {
                *sum.revenue.entry(o.total.currency.clone()).or_default() += o.total.amount;
            }
        }
        counter!("view_recompute_total", 1u64, "view" => "summary");
        let out = Arc::new(sum);
        memo.summary = Some((sig, Arc::clone(&out)));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::Money;

    fn rec(id: &str, ts: i64, status: FulfillmentStatus) -> OrderRecord { OrderRecord::new(id, id, ts, status) }

    fn ids(v: &[OrderRecord]) -> Vec<&str> { v.iter().map(|o| o.id.as_str()).collect() }

    #[test]
    fn prepend_replace_and_evict() {
        let mut c = OrderCollection::with_capacity(3);
        for (i, id) in ["a", "b", "c"].iter().enumerate() {
            assert_eq!(c.upsert(rec(id, i as i64, FulfillmentStatus::NotFulfilled)).unwrap(), UpsertOutcome::Inserted { evicted: None });
        }
        assert_eq!(ids(&c.to_vec()), vec!["c", "b", "a"]);

        // replace keeps position and created_at
        let mut b2 = rec("b", 99, FulfillmentStatus::Fulfilled);
        b2.number = "B".into();
        assert_eq!(c.upsert(b2).unwrap(), UpsertOutcome::Replaced);
        assert_eq!(ids(&c.to_vec()), vec!["c", "b", "a"]);
        let b = c.get("b").unwrap();
        assert_eq!((b.number.as_str(), b.created_at, b.status), ("B", 1, FulfillmentStatus::Fulfilled));

        assert_eq!(c.upsert(rec("d", 3, FulfillmentStatus::NotFulfilled)).unwrap(), UpsertOutcome::Inserted { evicted: Some("a".into()) });
        assert_eq!(ids(&c.to_vec()), vec!["d", "c", "b"]);
        assert!(!c.contains("a"));
        assert_eq!(c.evicted(), 1);
    }

    #[test]
    fn malformed_and_remove() {
        let mut c = OrderCollection::with_capacity(10);
        assert!(matches!(c.upsert(rec("  ", 0, FulfillmentStatus::Fulfilled)), Err(RecordError::MalformedRecord(_))));
        assert!(c.is_empty());
        c.upsert(rec("a", 0, FulfillmentStatus::Fulfilled)).unwrap();
        assert!(!c.remove_by_id("zzz"));
        assert!(c.remove_by_id("a"));
        assert!(c.is_empty());
        assert_eq!(c.ids_len(), 0);
    }

    #[test]
    fn dedup_and_capacity_invariants_hold_over_random_sequence() {
        let mut c = OrderCollection::with_capacity(7);
        // deterministic pseudo-random walk over 20 ids
        let mut x: u64 = 42;
        for step in 0..500 {
            x = x.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            let id = format!("o{}", (x >> 33) % 20);
            if (x >> 20) % 5 == 0 {
                c.remove_by_id(&id);
            } else {
                c.upsert(rec(&id, step, FulfillmentStatus::NotFulfilled)).unwrap();
            }
            let distinct: FxHashSet<&str> = c.iter().map(|o| o.id.as_str()).collect();
            assert_eq!(distinct.len(), c.len());
            assert_eq!(c.ids_len(), distinct.len());
            assert!(c.len() <= c.capacity());
        }
    }

    #[test]
    fn upsert_is_idempotent() {
        let mut once = OrderCollection::with_capacity(5);
        let mut twice = OrderCollection::with_capacity(5);
        for c in [&mut once, &mut twice] {
            c.upsert(rec("a", 1, FulfillmentStatus::NotFulfilled)).unwrap();
        }
        let r = rec("b", 2, FulfillmentStatus::Fulfilled);
        once.upsert(r.clone()).unwrap();
        twice.upsert(r.clone()).unwrap();
        twice.upsert(r).unwrap();
        assert_eq!(once.to_vec(), twice.to_vec());
        assert_eq!(once.signature(), twice.signature());
    }

    #[test]
    fn views_are_memoized_until_signature_changes() {
        let mut c = OrderCollection::with_capacity(10);
        c.upsert(rec("1", 0, FulfillmentStatus::Fulfilled)).unwrap();
        c.upsert(rec("2", 1, FulfillmentStatus::NotFulfilled)).unwrap();
        let v1 = c.by_status(FulfillmentStatus::Fulfilled);
        let v2 = c.by_status(FulfillmentStatus::Fulfilled);
        assert!(Arc::ptr_eq(&v1, &v2));
        assert_eq!(ids(&v1), vec!["1"]);

        // status flip of an existing id changes the digest
        c.upsert(rec("2", 1, FulfillmentStatus::Fulfilled)).unwrap();
        let v3 = c.by_status(FulfillmentStatus::Fulfilled);
        assert!(!Arc::ptr_eq(&v1, &v3));
        assert_eq!(ids(&v3), vec!["2", "1"]);
        assert!(c.unfulfilled().is_empty());
    }

    #[test]
    fn summary_tracks_totals() {
        let mut c = OrderCollection::with_capacity(10);
        let mut a = rec("a", 0, FulfillmentStatus::Fulfilled);
        a.total = Money { amount: 10.0, currency: "USD".into() };
        let mut b = rec("b", 1, FulfillmentStatus::Canceled);
        b.total = Money { amount: 5.0, currency: "USD".into() };
        c.upsert(a.clone()).unwrap();
        c.upsert(b).unwrap();
        let s1 = c.summary();
        assert_eq!(s1.total, 2);
        assert_eq!(s1.by_status.get(&FulfillmentStatus::Canceled), Some(&1));
        assert_eq!(s1.revenue.get("USD"), Some(&10.0));

        // amount-only change must invalidate the aggregate
        a.total.amount = 12.5;
        c.upsert(a).unwrap();
        assert_eq!(c.summary().revenue.get("USD"), Some(&12.5));
    }
}
