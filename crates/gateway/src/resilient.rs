//! Timeout + exponential backoff with jitter around remote calls.

use async_trait::async_trait;
use metrics::{counter, histogram};
use ordo_core::Settings;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::{CustomerIdentity, GatewayError, IdentityResolver, OrderGateway, OrderQuery, QueryPage};

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Total attempts, including the first.
    pub attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(10), attempts: 3, backoff_base: BACKOFF_BASE, backoff_max: BACKOFF_MAX }
    }
}

impl RetryPolicy {
    pub fn from_settings(s: &Settings) -> Self {
        Self { timeout: s.gateway_timeout(), attempts: s.gateway_retries.max(1), ..Self::default() }
    }

    /// Run `f` under the per-attempt timeout, retrying retryable failures.
    pub async fn call<T, F, Fut>(&self, op: &'static str, mut f: F) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 0u32;
        let mut backoff = self.backoff_base;
        loop {
            attempt += 1;
            let started = Instant::now();
            let res = match tokio::time::timeout(self.timeout, f()).await {
                Ok(r) => r,
                Err(_) => Err(GatewayError::Timeout(self.timeout)),
            };
            histogram!("gateway_call_ms", started.elapsed().as_secs_f64() * 1000.0, "op" => op);
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && attempt < self.attempts => {
                    counter!("gateway_retries_total", 1u64, "op" => op, "kind" => e.kind());
                    let delay = backoff.min(self.backoff_max) + Duration::from_millis(rand_jitter());
                    warn!(op, attempt, error = %e, delay_ms = delay.as_millis() as u64, "remote call failed; retrying");
                    tokio::time::sleep(delay).await;
                    backoff = backoff.saturating_mul(2);
                }
                Err(e) => {
                    counter!("gateway_failures_total", 1u64, "op" => op, "kind" => e.kind());
                    debug!(op, attempt, error = %e, "remote call gave up");
                    return Err(e);
                }
            }
        }
    }
}

/// Jitter in [0, 50) ms taken from the clock's sub-second nanos.
fn rand_jitter() -> u64 {
    let seed = u64::from(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos(),
    );
    seed % 50
}

/// [`OrderGateway`] decorator applying a [`RetryPolicy`].
pub struct ResilientGateway {
    inner: Arc<dyn OrderGateway>,
    policy: RetryPolicy,
}

impl ResilientGateway {
    pub fn new(inner: Arc<dyn OrderGateway>, policy: RetryPolicy) -> Self { Self { inner, policy } }
}

#[async_trait]
impl OrderGateway for ResilientGateway {
    async fn query(&self, query: &OrderQuery) -> Result<QueryPage, GatewayError> {
        self.policy.call("orders.query", || self.inner.query(query)).await
    }
}

/// [`IdentityResolver`] decorator applying a [`RetryPolicy`].
pub struct ResilientResolver {
    inner: Arc<dyn IdentityResolver>,
    policy: RetryPolicy,
}

impl ResilientResolver {
    pub fn new(inner: Arc<dyn IdentityResolver>, policy: RetryPolicy) -> Self { Self { inner, policy } }
}

#[async_trait]
impl IdentityResolver for ResilientResolver {
    async fn resolve_by_name(&self, text: &str) -> Result<Vec<CustomerIdentity>, GatewayError> {
        self.policy.call("contacts.resolve", || self.inner.resolve_by_name(text)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{MemoryGateway, QueryFilter};
    use ordo_core::{FulfillmentStatus, OrderRecord};

    fn gateway() -> Arc<MemoryGateway> {
        Arc::new(MemoryGateway::new(vec![OrderRecord::new("a", "1", 1, FulfillmentStatus::Fulfilled)]))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures() {
        let mem = gateway();
        mem.push_failure(GatewayError::Unavailable("blip".into()));
        mem.push_failure(GatewayError::Server { status: 502, message: "bad gateway".into() });
        let g = ResilientGateway::new(mem.clone(), RetryPolicy::default());
        let page = g.query(&OrderQuery::first_page(QueryFilter::NumberEq("1".into()), 10)).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(mem.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_are_not_retried() {
        let mem = gateway();
        mem.push_failure(GatewayError::RateLimited("quota".into()));
        let g = ResilientGateway::new(mem.clone(), RetryPolicy::default());
        let err = g.query(&OrderQuery::first_page(QueryFilter::NumberEq("1".into()), 10)).await.unwrap_err();
        assert!(matches!(err, GatewayError::RateLimited(_)));
        assert_eq!(mem.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_calls_time_out() {
        let mem = Arc::new(MemoryGateway::new(Vec::new()).with_latency(Duration::from_secs(60)));
        let policy = RetryPolicy { timeout: Duration::from_secs(1), attempts: 2, ..RetryPolicy::default() };
        let g = ResilientGateway::new(mem.clone(), policy);
        let err = g.query(&OrderQuery::first_page(QueryFilter::NumberEq("1".into()), 10)).await.unwrap_err();
        assert_eq!(err, GatewayError::Timeout(Duration::from_secs(1)));
        assert_eq!(mem.calls(), 2);
    }
}
