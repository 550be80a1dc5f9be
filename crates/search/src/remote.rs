//! Remote stage: translate free text into a structured gateway filter.

use std::sync::OnceLock;

use ordo_core::{normalize_email, OrderFilter, StatusKey};
use ordo_gateway::{IdentityResolver, QueryFilter};
use regex::Regex;
use tracing::{debug, warn};

fn numeric() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^#?(\d+)$").ok()).as_ref()
}

fn complete_email() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]{2,}$").ok()).as_ref()
}

/// How a normalized query is sent to the remote source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryKind {
    Empty,
    OrderNumber(String),
    Email { value: String, complete: bool },
    FreeText(String),
}

pub fn classify(q: &str) -> QueryKind {
    let q = q.trim();
    if q.is_empty() { return QueryKind::Empty; }
    if let Some(c) = numeric().and_then(|re| re.captures(q)) {
        if let Some(m) = c.get(1) { return QueryKind::OrderNumber(m.as_str().to_string()); }
    }
    if q.contains('@') {
        let value = normalize_email(q);
        let complete = complete_email().map(|re| re.is_match(&value)).unwrap_or(false);
        return QueryKind::Email { value, complete };
    }
    QueryKind::FreeText(q.to_lowercase())
}

/// Remote filter for `q`, or `None` when the query stays local: empty text,
/// no resolver, resolver failure, or no identities found.
pub async fn build_remote_filter(q: &str, resolver: Option<&dyn IdentityResolver>) -> Option<QueryFilter> {
    match classify(q) {
        QueryKind::Empty => None,
        QueryKind::OrderNumber(n) => Some(QueryFilter::NumberEq(n)),
        QueryKind::Email { value, complete: true } => Some(QueryFilter::EmailEq(value)),
        QueryKind::Email { value, complete: false } => Some(QueryFilter::EmailPrefix(value)),
        QueryKind::FreeText(text) => {
            let resolver = resolver?;
            let identities = match resolver.resolve_by_name(&text).await {
                Ok(ids) => ids,
                Err(e) => {
                    warn!(error = %e, "identity resolution failed; staying local");
                    metrics::counter!("search_identity_failures_total", 1u64);
                    return None;
                }
            };
            let mut parts: Vec<QueryFilter> = Vec::new();
            for id in &identities {
                for f in id.to_filters() {
                    if !parts.contains(&f) { parts.push(f); }
                }
            }
            debug!(identities = identities.len(), filters = parts.len(), "resolved free text");
            if parts.is_empty() { None } else { Some(QueryFilter::Any(parts)) }
        }
    }
}

/// Conjunction of a text filter with the status/date filters, if any.
pub fn with_filters(text: QueryFilter, filters: &OrderFilter) -> QueryFilter {
    if filters.is_empty() { return text; }
    let mut all = vec![text];
    if let Some(s) = filters.status { all.push(QueryFilter::Status(StatusKey::Fulfillment(s))); }
    if filters.created_from.is_some() || filters.created_to.is_some() {
        all.push(QueryFilter::CreatedBetween { from: filters.created_from, to: filters.created_to });
    }
    QueryFilter::All(all)
}
