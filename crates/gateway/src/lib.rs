//! Ordo gateway: the remote, paginated order source and the optional identity
//! resolution capability, plus the timeout/retry policy wrapped around both.

#![forbid(unsafe_code)]

use async_trait::async_trait;
use ordo_core::{Millis, OrderRecord, StatusKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod memory;
pub mod resilient;

pub use memory::{MemoryDirectory, MemoryGateway};
pub use resilient::{ResilientGateway, ResilientResolver, RetryPolicy};

/// Structured remote filter. Text operands are expected lowercased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QueryFilter {
    NumberEq(String),
    EmailEq(String),
    EmailPrefix(String),
    /// Prefix of the customer's full name.
    NamePrefix(String),
    Status(StatusKey),
    CreatedBetween { from: Option<Millis>, to: Option<Millis> },
    Any(Vec<QueryFilter>),
    All(Vec<QueryFilter>),
}

impl QueryFilter {
    /// Reference semantics of each filter; remote services are expected to agree.
    pub fn matches(&self, o: &OrderRecord) -> bool {
        match self {
            QueryFilter::NumberEq(n) => o.number == *n,
            QueryFilter::EmailEq(e) => o.email() == Some(e.as_str()),
            QueryFilter::EmailPrefix(p) => o.email().map(|e| e.starts_with(p.as_str())).unwrap_or(false),
            QueryFilter::NamePrefix(p) => o
                .customer
                .name
                .as_deref()
                .map(|n| n.to_lowercase().starts_with(p.as_str()))
                .unwrap_or(false),
            QueryFilter::Status(k) => k.matches(o),
            QueryFilter::CreatedBetween { from, to } => {
                from.map(|f| o.created_at >= f).unwrap_or(true) && to.map(|t| o.created_at <= t).unwrap_or(true)
            }
            QueryFilter::Any(fs) => fs.iter().any(|f| f.matches(o)),
            QueryFilter::All(fs) => fs.iter().all(|f| f.matches(o)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    CreatedDesc,
    CreatedAsc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPaging {
    pub limit: usize,
    pub cursor: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderQuery {
    pub filter: QueryFilter,
    pub sort: SortOrder,
    pub paging: CursorPaging,
}

impl OrderQuery {
    pub fn first_page(filter: QueryFilter, limit: usize) -> Self {
        Self { filter, sort: SortOrder::CreatedDesc, paging: CursorPaging { limit, cursor: None } }
    }

    pub fn after(&self, cursor: Option<String>) -> Self {
        Self { paging: CursorPaging { limit: self.paging.limit, cursor }, ..self.clone() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryPage {
    pub records: Vec<OrderRecord>,
    pub has_next: bool,
    pub next_cursor: Option<String>,
}

/// One customer identity returned by name resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomerIdentity {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
}

impl CustomerIdentity {
    pub fn full_name(&self) -> Option<String> {
        let parts: Vec<&str> = [self.first_name.as_deref(), self.last_name.as_deref()]
            .into_iter()
            .flatten()
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .collect();
        if parts.is_empty() { None } else { Some(parts.join(" ")) }
    }

    /// Disjunction of the filterable fields this identity provides.
    pub fn to_filters(&self) -> Vec<QueryFilter> {
        let mut out = Vec::new();
        if let Some(n) = self.full_name() { out.push(QueryFilter::NamePrefix(n.to_lowercase())); }
        if let Some(e) = self.email.as_deref().map(ordo_core::normalize_email).filter(|e| !e.is_empty()) {
            out.push(QueryFilter::EmailPrefix(e));
        }
        out
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limited: {0}")]
    RateLimited(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },
    #[error("decode: {0}")]
    Decode(String),
}

impl GatewayError {
    /// Quota errors are never retried; callers back off instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            GatewayError::Timeout(_) | GatewayError::Unavailable(_) => true,
            GatewayError::Server { status, .. } => *status >= 500,
            GatewayError::RateLimited(_) | GatewayError::Decode(_) => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::Timeout(_) => "timeout",
            GatewayError::RateLimited(_) => "rate_limited",
            GatewayError::Unavailable(_) => "unavailable",
            GatewayError::Server { .. } => "server",
            GatewayError::Decode(_) => "decode",
        }
    }
}

/// Paginated remote order source.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn query(&self, query: &OrderQuery) -> Result<QueryPage, GatewayError>;
}

/// Optional capability translating free text into customer identities.
#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn resolve_by_name(&self, text: &str) -> Result<Vec<CustomerIdentity>, GatewayError>;
}

/// Decode a raw page payload (`{"orders": [...], "metadata": {...}}`) at the
/// boundary. Records without an id are skipped rather than failing the page.
pub fn decode_page(raw: &serde_json::Value) -> Result<QueryPage, GatewayError> {
    let items = raw
        .get("orders")
        .and_then(|v| v.as_array())
        .ok_or_else(|| GatewayError::Decode("missing orders array".into()))?;
    let mut records = Vec::with_capacity(items.len());
    for it in items {
        match OrderRecord::from_raw(it) {
            Ok(r) => records.push(r),
            Err(e) => tracing::debug!(error = %e, "skipping undecodable order"),
        }
    }
    let next_cursor = raw
        .pointer("/metadata/cursors/next")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());
    let has_next = raw
        .pointer("/metadata/hasNext")
        .and_then(|v| v.as_bool())
        .unwrap_or(next_cursor.is_some());
    Ok(QueryPage { records, has_next, next_cursor })
}
