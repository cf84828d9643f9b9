//! Route set refresh with cache fallback.
//!
//! Live fetch (retried with exponential backoff on network errors) → validate
//! → overwrite the cache → use the live set. When the live fetch fails, the
//! cached set is used, and when there is none either, the empty set.

use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::cache::RouteCache;
use crate::error::ProviderError;
use crate::providers::RouteProvider;
use crate::routes::{validate_records, RestrictedRoute, RouteRecord};

/// Retry policy for the live fetch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshPolicy {
    /// Retries after the first attempt. Parse errors are never retried.
    /// Default: 3
    pub max_retries: u32,

    /// Backoff before retry `n` is `base_backoff_ms * 2^n`.
    /// Default: 200 ms (400ms, 800ms, 1.6s)
    pub base_backoff_ms: u64,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff_ms: 200,
        }
    }
}

impl RefreshPolicy {
    fn backoff(&self, retry: u32) -> Duration {
        Duration::from_millis(self.base_backoff_ms.saturating_mul(1u64 << retry.min(16)))
    }
}

/// Where a refreshed route set came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouteSource {
    Live,
    Cache { fetched_at: DateTime<Utc> },
    Empty,
}

#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    pub routes: Vec<RestrictedRoute>,
    pub source: RouteSource,
}

/// Fetch from `provider`, retrying network errors per `policy`.
pub async fn fetch_with_retry(
    provider: &dyn RouteProvider,
    policy: &RefreshPolicy,
) -> Result<Vec<RouteRecord>, ProviderError> {
    let mut retries = 0;
    loop {
        match provider.fetch_restricted_routes().await {
            Ok(records) => return Ok(records),
            Err(e @ ProviderError::Network(_)) if retries < policy.max_retries => {
                retries += 1;
                let wait = policy.backoff(retries);
                warn!("[RouteRefresh] Fetch failed: {}, retry {} after {:?}", e, retries, wait);
                tokio::time::sleep(wait).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Produce the route set to use, per the live → cache → empty policy.
pub async fn refresh_routes(provider: &dyn RouteProvider, cache: &RouteCache, policy: &RefreshPolicy) -> RefreshOutcome {
    match fetch_with_retry(provider, policy).await {
        Ok(records) => {
            let fetched = records.len();
            let routes = validate_records(records);
            if let Err(e) = cache.save(&routes, Utc::now()) {
                warn!("[RouteRefresh] Failed to update cache: {}", e);
            }
            info!("[RouteRefresh] Using {} live routes ({} fetched)", routes.len(), fetched);
            RefreshOutcome { routes, source: RouteSource::Live }
        }
        Err(e) => {
            warn!("[RouteRefresh] Live fetch failed: {}", e);
            match cache.load() {
                Some(cached) => {
                    info!(
                        "[RouteRefresh] Falling back to {} cached routes from {}",
                        cached.routes.len(),
                        cached.fetched_at.to_rfc3339()
                    );
                    RefreshOutcome {
                        routes: cached.routes,
                        source: RouteSource::Cache { fetched_at: cached.fetched_at },
                    }
                }
                None => {
                    warn!("[RouteRefresh] No cached routes, continuing with none");
                    RefreshOutcome { routes: Vec::new(), source: RouteSource::Empty }
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::routes::{RouteId, TimeRangeRecord};
    use chrono::TimeZone;
    use futures::future::{self, BoxFuture};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    pub(crate) fn record(id: &str) -> RouteRecord {
        RouteRecord {
            id: RouteId::new(id),
            street: format!("Street {}", id),
            coordinates: vec![[2.3500, 48.8566], [2.3530, 48.8566]],
            days: vec!["Monday".into()],
            time_ranges: vec![TimeRangeRecord { start: "07:00:00".into(), end: "09:00:00".into() }],
            side: None,
            restriction_type: None,
        }
    }

    /// Provider failing `failures` times with the given error, then serving `records`.
    pub(crate) struct FlakyProvider {
        pub failures: AtomicU32,
        pub error: ProviderError,
        pub records: Vec<RouteRecord>,
        pub calls: AtomicU32,
    }

    impl FlakyProvider {
        pub fn new(failures: u32, records: Vec<RouteRecord>) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                error: ProviderError::Network("connection reset".into()),
                records,
                calls: AtomicU32::new(0),
            }
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RouteProvider for FlakyProvider {
        fn fetch_restricted_routes(&self) -> BoxFuture<'_, Result<Vec<RouteRecord>, ProviderError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures.store(remaining - 1, Ordering::SeqCst);
                return Box::pin(future::ready(Err(self.error.clone())));
            }
            Box::pin(future::ready(Ok(self.records.clone())))
        }
    }

    fn ids(outcome: &RefreshOutcome) -> Vec<&str> {
        outcome.routes.iter().map(|r| r.id().as_str()).collect()
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RefreshPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_millis(400));
        assert_eq!(policy.backoff(2), Duration::from_millis(800));
        assert_eq!(policy.backoff(3), Duration::from_millis(1600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_fetch_overwrites_cache() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let old = validate_records(vec![record("old")]);
        cache.save(&old, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()).unwrap();

        let provider = FlakyProvider::new(0, vec![record("a"), record("b")]);
        let outcome = refresh_routes(&provider, &cache, &RefreshPolicy::default()).await;

        assert_eq!(outcome.source, RouteSource::Live);
        assert_eq!(ids(&outcome), vec!["a", "b"]);
        let cached = cache.load().unwrap();
        assert_eq!(cached.routes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_network_errors() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let provider = FlakyProvider::new(2, vec![record("a")]);
        let outcome = refresh_routes(&provider, &cache, &RefreshPolicy::default()).await;

        assert_eq!(outcome.source, RouteSource::Live);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_error_not_retried() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let mut provider = FlakyProvider::new(5, vec![record("a")]);
        provider.error = ProviderError::Parse("unexpected token".into());
        let outcome = refresh_routes(&provider, &cache, &RefreshPolicy::default()).await;

        assert_eq!(outcome.source, RouteSource::Empty);
        assert_eq!(provider.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_to_cache() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let fetched_at = Utc.with_ymd_and_hms(2024, 1, 1, 7, 0, 0).unwrap();
        cache.save(&validate_records(vec![record("cached")]), fetched_at).unwrap();

        let provider = FlakyProvider::new(u32::MAX, vec![]);
        let policy = RefreshPolicy { max_retries: 2, base_backoff_ms: 10 };
        let outcome = refresh_routes(&provider, &cache, &policy).await;

        assert_eq!(outcome.source, RouteSource::Cache { fetched_at });
        assert_eq!(ids(&outcome), vec!["cached"]);
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_without_cache() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let provider = FlakyProvider::new(u32::MAX, vec![]);
        let outcome = refresh_routes(&provider, &cache, &RefreshPolicy::default()).await;

        assert_eq!(outcome.source, RouteSource::Empty);
        assert!(outcome.routes.is_empty());
        assert!(cache.load().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_live_records_are_dropped() {
        let cache = RouteCache::new(Arc::new(MemoryStore::new()));
        let mut broken = record("broken");
        broken.coordinates.truncate(1);
        let provider = FlakyProvider::new(0, vec![broken, record("ok")]);
        let outcome = refresh_routes(&provider, &cache, &RefreshPolicy::default()).await;

        assert_eq!(ids(&outcome), vec!["ok"]);
    }
}
