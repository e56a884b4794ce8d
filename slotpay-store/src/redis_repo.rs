use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use slotpay_core::repository::{RateLimitStore, StoreError, StoreResult};
use tracing::debug;

/// INCR, and start the window's TTL only on the first hit so the window never slides.
const FIXED_WINDOW_SCRIPT: &str = r#"
    local count = redis.call("INCR", KEYS[1])
    if count == 1 then
        redis.call("PEXPIRE", KEYS[1], ARGV[1])
    end
    return count
"#;

#[derive(Clone)]
pub struct RedisClient {
    client: redis::Client,
}

impl RedisClient {
    pub async fn new(connection_string: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(connection_string)?;
        Ok(Self { client })
    }

    pub async fn check_rate_limit(&self, key: &str, window_ms: i64) -> redis::RedisResult<u64> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let script = redis::Script::new(FIXED_WINDOW_SCRIPT);
        let count: u64 = script.key(key).arg(window_ms).invoke_async(&mut conn).await?;
        debug!(key, count, "Rate limit hit counted");
        Ok(count)
    }
}

#[async_trait]
impl RateLimitStore for RedisClient {
    /// Redis keeps its own clock for the window; `now` is not needed here.
    async fn hit(&self, key: &str, window: Duration, _now: DateTime<Utc>) -> StoreResult<u64> {
        let window_ms = window.num_milliseconds().max(1);
        self.check_rate_limit(key, window_ms)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }
}
