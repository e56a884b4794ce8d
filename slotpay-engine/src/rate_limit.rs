use slotpay_core::repository::RateLimitStore;
use slotpay_core::Clock;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter backend unavailable: {0}")]
    LimiterUnavailable(String),
    #[error("invalid rate limit policy: {0}")]
    InvalidPolicy(String),
}

/// Fixed-window limiter over a shared counter store.
pub struct RateLimiter {
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn RateLimitStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// `true` while `key` has made at most `limit` calls in the current window. Whether to let
    /// traffic through on `LimiterUnavailable` is the caller's policy.
    pub async fn allow(&self, key: &str, limit: u64, window: Duration) -> Result<bool, RateLimitError> {
        if limit == 0 || window.is_zero() {
            return Err(RateLimitError::InvalidPolicy(format!(
                "limit {} per {}s never admits a call",
                limit,
                window.as_secs()
            )));
        }
        let window = chrono::Duration::from_std(window)
            .map_err(|e| RateLimitError::InvalidPolicy(format!("window out of range: {e}")))?;
        let count = self
            .store
            .hit(key, window, self.clock.now())
            .await
            .map_err(|e| {
                warn!(key, error = %e, "Rate limit store failed");
                RateLimitError::LimiterUnavailable(e.to_string())
            })?;

        let allowed = count <= limit;
        if !allowed {
            debug!(key, count, limit, "Rate limit exceeded");
        }
        Ok(allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use slotpay_core::repository::{StoreError, StoreResult};
    use slotpay_core::ManualClock;
    use slotpay_store::MemoryStore;

    struct Down;

    #[async_trait]
    impl RateLimitStore for Down {
        async fn hit(&self, _key: &str, _window: chrono::Duration, _now: DateTime<Utc>) -> StoreResult<u64> {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_allows_limit_then_rejects_until_window_ends() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), clock.clone());
        let window = Duration::from_secs(60);

        for _ in 0..5 {
            assert!(limiter.allow("ratelimit:1.2.3.4:acquire", 5, window).await.unwrap());
        }
        assert!(!limiter.allow("ratelimit:1.2.3.4:acquire", 5, window).await.unwrap());
        assert!(limiter.allow("ratelimit:5.6.7.8:acquire", 5, window).await.unwrap());

        clock.advance(chrono::Duration::seconds(60));
        assert!(limiter.allow("ratelimit:1.2.3.4:acquire", 5, window).await.unwrap());
    }

    #[tokio::test]
    async fn test_keys_with_different_windows_count_independently() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), clock.clone());
        let hour = Duration::from_secs(3600);

        assert!(limiter.allow("ratelimit:ip:acquire", 1, hour).await.unwrap());
        assert!(!limiter.allow("ratelimit:ip:acquire", 1, hour).await.unwrap());

        clock.advance(chrono::Duration::seconds(5));
        assert!(limiter.allow("ratelimit:ip:other", 10, Duration::from_secs(1)).await.unwrap());
        assert!(!limiter.allow("ratelimit:ip:acquire", 1, hour).await.unwrap());
    }

    #[tokio::test]
    async fn test_zero_limit_or_window_is_rejected() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(ManualClock::new(Utc::now())));
        assert!(matches!(
            limiter.allow("k", 5, Duration::ZERO).await,
            Err(RateLimitError::InvalidPolicy(_))
        ));
        assert!(matches!(
            limiter.allow("k", 0, Duration::from_secs(60)).await,
            Err(RateLimitError::InvalidPolicy(_))
        ));
    }

    #[tokio::test]
    async fn test_store_failure_surfaces_as_unavailable() {
        let limiter = RateLimiter::new(Arc::new(Down), Arc::new(ManualClock::new(Utc::now())));
        assert!(matches!(
            limiter.allow("k", 5, Duration::from_secs(60)).await,
            Err(RateLimitError::LimiterUnavailable(_))
        ));
    }
}
