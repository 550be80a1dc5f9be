//! Ordo core types: normalized order records, filters, clock and settings.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

pub mod normalize;
pub mod settings;

pub use settings::Settings;

pub type OrderId = String;

/// Epoch milliseconds.
pub type Millis = i64;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("malformed record: {0}")]
    MalformedRecord(String),
    #[error("invalid {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FulfillmentStatus {
    NotFulfilled,
    PartiallyFulfilled,
    Fulfilled,
    Canceled,
}

impl FulfillmentStatus {
    pub const ALL: [FulfillmentStatus; 4] = [
        FulfillmentStatus::NotFulfilled,
        FulfillmentStatus::PartiallyFulfilled,
        FulfillmentStatus::Fulfilled,
        FulfillmentStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FulfillmentStatus::NotFulfilled => "NOT_FULFILLED",
            FulfillmentStatus::PartiallyFulfilled => "PARTIALLY_FULFILLED",
            FulfillmentStatus::Fulfilled => "FULFILLED",
            FulfillmentStatus::Canceled => "CANCELED",
        }
    }

    /// Not yet (fully) shipped and still actionable.
    pub fn is_open(&self) -> bool {
        matches!(self, FulfillmentStatus::NotFulfilled | FulfillmentStatus::PartiallyFulfilled)
    }
}

impl std::str::FromStr for FulfillmentStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "NOT_FULFILLED" | "UNFULFILLED" => Ok(FulfillmentStatus::NotFulfilled),
            "PARTIALLY_FULFILLED" => Ok(FulfillmentStatus::PartiallyFulfilled),
            "FULFILLED" => Ok(FulfillmentStatus::Fulfilled),
            "CANCELED" | "CANCELLED" => Ok(FulfillmentStatus::Canceled),
            _ => Err(RecordError::InvalidField { field: "status", value: s.to_string() }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    #[default]
    Unspecified,
    NotPaid,
    Pending,
    PartiallyPaid,
    Paid,
    PartiallyRefunded,
    FullyRefunded,
    Canceled,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Unspecified => "UNSPECIFIED",
            PaymentStatus::NotPaid => "NOT_PAID",
            PaymentStatus::Pending => "PENDING",
            PaymentStatus::PartiallyPaid => "PARTIALLY_PAID",
            PaymentStatus::Paid => "PAID",
            PaymentStatus::PartiallyRefunded => "PARTIALLY_REFUNDED",
            PaymentStatus::FullyRefunded => "FULLY_REFUNDED",
            PaymentStatus::Canceled => "CANCELED",
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = RecordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_token(s).as_str() {
            "UNSPECIFIED" | "UNSPECIFIED_PAYMENT_STATUS" => Ok(PaymentStatus::Unspecified),
            "NOT_PAID" | "UNPAID" => Ok(PaymentStatus::NotPaid),
            "PENDING" => Ok(PaymentStatus::Pending),
            "PARTIALLY_PAID" => Ok(PaymentStatus::PartiallyPaid),
            "PAID" => Ok(PaymentStatus::Paid),
            "PARTIALLY_REFUNDED" => Ok(PaymentStatus::PartiallyRefunded),
            "FULLY_REFUNDED" | "REFUNDED" => Ok(PaymentStatus::FullyRefunded),
            "CANCELED" | "CANCELLED" => Ok(PaymentStatus::Canceled),
            _ => Err(RecordError::InvalidField { field: "payment_status", value: s.to_string() }),
        }
    }
}

fn normalize_token(s: &str) -> String {
    s.trim().replace(['-', ' '], "_").to_ascii_uppercase()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Money {
    pub amount: f64,
    /// ISO 4217 code, uppercased. Empty when the source omitted it.
    pub currency: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Customer {
    pub name: Option<String>,
    /// Trimmed and lowercased at the boundary.
    pub email: Option<String>,
    pub phone: Option<String>,
    pub company: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineItem {
    pub name: String,
    pub quantity: u32,
    pub sku: Option<String>,
    pub price: Option<Money>,
}

/// Canonical, normalized representation of one customer order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderRecord {
    pub id: OrderId,
    pub created_at: Millis,
    pub status: FulfillmentStatus,
    pub payment_status: PaymentStatus,
    pub total: Money,
    /// Display order number (e.g. "10042").
    pub number: String,
    pub customer: Customer,
    pub line_items: SmallVec<[LineItem; 2]>,
    /// Unmodeled source fields, passed through untouched.
    pub extra: serde_json::Value,
}

impl OrderRecord {
    /// Minimal record; mostly useful for tests and fixtures.
    pub fn new(id: impl Into<OrderId>, number: impl Into<String>, created_at: Millis, status: FulfillmentStatus) -> Self {
        Self {
            id: id.into(),
            created_at,
            status,
            payment_status: PaymentStatus::Unspecified,
            total: Money::default(),
            number: number.into(),
            customer: Customer::default(),
            line_items: SmallVec::new(),
            extra: serde_json::Value::Null,
        }
    }

    pub fn with_customer(mut self, name: Option<&str>, email: Option<&str>) -> Self {
        self.customer.name = name.map(|s| s.to_string());
        self.customer.email = email.map(normalize_email).filter(|e| !e.is_empty());
        self
    }

    pub fn email(&self) -> Option<&str> { self.customer.email.as_deref() }
}

/// Trim + lowercase; emails are compared and keyed in this form everywhere.
pub fn normalize_email(raw: &str) -> String { raw.trim().to_lowercase() }

/// Status/date filters shared by views, local scans and cache keys.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderFilter {
    pub status: Option<FulfillmentStatus>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<Millis>,
    /// Inclusive upper bound on `created_at`.
    pub created_to: Option<Millis>,
}

impl OrderFilter {
    pub fn is_empty(&self) -> bool {
        self.status.is_none() && self.created_from.is_none() && self.created_to.is_none()
    }

    pub fn matches(&self, o: &OrderRecord) -> bool {
        if let Some(s) = self.status { if o.status != s { return false; } }
        if let Some(from) = self.created_from { if o.created_at < from { return false; } }
        if let Some(to) = self.created_to { if o.created_at > to { return false; } }
        true
    }

    /// Stable textual signature, part of search cache keys.
    pub fn signature(&self) -> String {
        format!(
            "st={};from={};to={}",
            self.status.map(|s| s.as_str()).unwrap_or("*"),
            self.created_from.map(|v| v.to_string()).unwrap_or_else(|| "*".into()),
            self.created_to.map(|v| v.to_string()).unwrap_or_else(|| "*".into()),
        )
    }
}

/// (status type, status value) pair used by status-only search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusKey {
    Fulfillment(FulfillmentStatus),
    Payment(PaymentStatus),
}

impl StatusKey {
    pub fn kind(&self) -> &'static str {
        match self {
            StatusKey::Fulfillment(_) => "fulfillment",
            StatusKey::Payment(_) => "payment",
        }
    }

    pub fn value(&self) -> &'static str {
        match self {
            StatusKey::Fulfillment(s) => s.as_str(),
            StatusKey::Payment(p) => p.as_str(),
        }
    }

    pub fn matches(&self, o: &OrderRecord) -> bool {
        match self {
            StatusKey::Fulfillment(s) => o.status == *s,
            StatusKey::Payment(p) => o.payment_status == *p,
        }
    }

    /// Parse `kind` ("fulfillment" | "payment") and a status value.
    pub fn parse(kind: &str, value: &str) -> Result<Self, RecordError> {
        match kind.trim().to_ascii_lowercase().as_str() {
            "fulfillment" | "status" => Ok(StatusKey::Fulfillment(value.parse()?)),
            "payment" => Ok(StatusKey::Payment(value.parse()?)),
            other => Err(RecordError::InvalidField { field: "status_kind", value: other.to_string() }),
        }
    }
}

impl std::fmt::Display for StatusKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind(), self.value())
    }
}

/// Time source for TTL bookkeeping. Injected so tests can drive expiry.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Millis;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Millis { chrono::Utc::now().timestamp_millis() }
}

/// Manually advanced clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock { now: Arc<AtomicI64> }

impl ManualClock {
    pub fn new(start: Millis) -> Self { Self { now: Arc::new(AtomicI64::new(start)) } }
    pub fn set(&self, t: Millis) { self.now.store(t, Ordering::SeqCst); }
    pub fn advance(&self, by: Millis) { self.now.fetch_add(by, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Millis { self.now.load(Ordering::SeqCst) }
}

pub mod prelude {
    pub use super::{
        Clock, Customer, FulfillmentStatus, LineItem, ManualClock, Millis, Money, OrderFilter, OrderId,
        OrderRecord, PaymentStatus, RecordError, Settings, StatusKey, SystemClock,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parsing_is_lenient() {
        assert_eq!("fulfilled".parse::<FulfillmentStatus>().unwrap(), FulfillmentStatus::Fulfilled);
        assert_eq!("Partially-Fulfilled".parse::<FulfillmentStatus>().unwrap(), FulfillmentStatus::PartiallyFulfilled);
        assert_eq!("CANCELLED".parse::<FulfillmentStatus>().unwrap(), FulfillmentStatus::Canceled);
        assert!("shipped".parse::<FulfillmentStatus>().is_err());
        assert_eq!("refunded".parse::<PaymentStatus>().unwrap(), PaymentStatus::FullyRefunded);
    }

    #[test]
    fn filter_bounds_are_inclusive() {
        let f = OrderFilter { status: Some(FulfillmentStatus::Fulfilled), created_from: Some(10), created_to: Some(20) };
        assert!(f.matches(&OrderRecord::new("a", "1", 10, FulfillmentStatus::Fulfilled)));
        assert!(f.matches(&OrderRecord::new("a", "1", 20, FulfillmentStatus::Fulfilled)));
        assert!(!f.matches(&OrderRecord::new("a", "1", 21, FulfillmentStatus::Fulfilled)));
        assert!(!f.matches(&OrderRecord::new("a", "1", 15, FulfillmentStatus::Canceled)));
        assert_ne!(f.signature(), OrderFilter::default().signature());
    }

    #[test]
    fn status_key_parse_and_match() {
        let k = StatusKey::parse("payment", "paid").unwrap();
        let mut o = OrderRecord::new("a", "1", 0, FulfillmentStatus::NotFulfilled);
        assert!(!k.matches(&o));
        o.payment_status = PaymentStatus::Paid;
        assert!(k.matches(&o));
        assert_eq!(k.to_string(), "payment:PAID");
        assert!(StatusKey::parse("shipping", "paid").is_err());
    }

    #[test]
    fn manual_clock_is_shared_across_clones() {
        let c = ManualClock::new(100);
        let c2 = c.clone();
        c.advance(50);
        assert_eq!(c2.now_ms(), 150);
    }
}
