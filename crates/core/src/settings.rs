//! Runtime limits and timings, read from `ORDO_*` environment variables.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub collection_cap: usize,
    pub search_ttl_ms: u64,
    pub search_cache_cap: usize,
    pub debounce_ms: u64,
    pub search_page_size: usize,
    pub count_ttl_secs: u64,
    pub count_cap: usize,
    pub count_page_size: usize,
    pub count_max_pages: usize,
    pub count_page_delay_ms: u64,
    pub count_customer_delay_ms: u64,
    pub gateway_timeout_ms: u64,
    pub gateway_retries: u32,
    pub queue_cap: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            collection_cap: 100,
            search_ttl_ms: 30_000,
            search_cache_cap: 10,
            debounce_ms: 300,
            search_page_size: 50,
            count_ttl_secs: 7 * 24 * 60 * 60,
            count_cap: 1000,
            count_page_size: 100,
            count_max_pages: 50,
            count_page_delay_ms: 200,
            count_customer_delay_ms: 500,
            gateway_timeout_ms: 10_000,
            gateway_retries: 3,
            queue_cap: 2048,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok()).unwrap_or(default)
}

impl Settings {
    /// Defaults overridden by any valid `ORDO_*` variable; invalid values are ignored.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            collection_cap: env_or("ORDO_COLLECTION_CAP", d.collection_cap).max(1),
            search_ttl_ms: env_or("ORDO_SEARCH_TTL_MS", d.search_ttl_ms),
            search_cache_cap: env_or("ORDO_SEARCH_CACHE_CAP", d.search_cache_cap).max(1),
            debounce_ms: env_or("ORDO_DEBOUNCE_MS", d.debounce_ms),
            search_page_size: env_or("ORDO_SEARCH_PAGE_SIZE", d.search_page_size).max(1),
            count_ttl_secs: env_or("ORDO_COUNT_TTL_SECS", d.count_ttl_secs),
            count_cap: env_or("ORDO_COUNT_CAP", d.count_cap).max(1),
            count_page_size: env_or("ORDO_COUNT_PAGE_SIZE", d.count_page_size).max(1),
            count_max_pages: env_or("ORDO_COUNT_MAX_PAGES", d.count_max_pages).max(1),
            count_page_delay_ms: env_or("ORDO_COUNT_PAGE_DELAY_MS", d.count_page_delay_ms),
            count_customer_delay_ms: env_or("ORDO_COUNT_CUSTOMER_DELAY_MS", d.count_customer_delay_ms),
            gateway_timeout_ms: env_or("ORDO_GATEWAY_TIMEOUT_MS", d.gateway_timeout_ms).max(1),
            gateway_retries: env_or("ORDO_GATEWAY_RETRIES", d.gateway_retries).max(1),
            queue_cap: env_or("ORDO_QUEUE_CAP", d.queue_cap).max(1),
        }
    }

    pub fn search_ttl(&self) -> Duration { Duration::from_millis(self.search_ttl_ms) }
    pub fn debounce(&self) -> Duration { Duration::from_millis(self.debounce_ms) }
    pub fn count_ttl(&self) -> Duration { Duration::from_secs(self.count_ttl_secs) }
    pub fn count_page_delay(&self) -> Duration { Duration::from_millis(self.count_page_delay_ms) }
    pub fn count_customer_delay(&self) -> Duration { Duration::from_millis(self.count_customer_delay_ms) }
    pub fn gateway_timeout(&self) -> Duration { Duration::from_millis(self.gateway_timeout_ms) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let s = Settings::default();
        assert_eq!(s.collection_cap, 100);
        assert_eq!(s.search_ttl(), Duration::from_secs(30));
        assert_eq!(s.search_cache_cap, 10);
        assert_eq!(s.debounce(), Duration::from_millis(300));
        assert_eq!(s.count_ttl(), Duration::from_secs(604_800));
        assert_eq!(s.count_cap, 1000);
        assert_eq!(s.gateway_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn env_overrides_and_ignores_garbage() {
        std::env::set_var("ORDO_COLLECTION_CAP", "7");
        std::env::set_var("ORDO_DEBOUNCE_MS", "not-a-number");
        let s = Settings::from_env();
        std::env::remove_var("ORDO_COLLECTION_CAP");
        std::env::remove_var("ORDO_DEBOUNCE_MS");
        assert_eq!(s.collection_cap, 7);
        assert_eq!(s.debounce_ms, 300);
    }
}
