use chrono::{DateTime, Duration, Utc};

/// Fixed-window counter for one `(identity, action)` key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitBucket {
    pub key: String,
    pub window: Duration,
    pub window_start: DateTime<Utc>,
    pub count: u64,
}

impl RateLimitBucket {
    pub fn open(key: impl Into<String>, window: Duration, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            window,
            window_start: now,
            count: 0,
        }
    }

    /// Counts one hit, starting a fresh window first if the current one has elapsed.
    pub fn hit(&mut self, now: DateTime<Utc>) -> u64 {
        if now >= self.window_start + self.window {
            self.window_start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count
    }

    /// A full window has passed since this bucket's window closed, so it can be dropped.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.window_start + self.window + self.window
    }
}

pub fn rate_limit_key(identity: &str, action: &str) -> String {
    format!("ratelimit:{}:{}", identity, action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_resets_after_window() {
        let start = Utc::now();
        let mut bucket = RateLimitBucket::open("k", Duration::seconds(60), start);
        assert_eq!(bucket.hit(start), 1);
        assert_eq!(bucket.hit(start + Duration::seconds(59)), 2);
        assert_eq!(bucket.hit(start + Duration::seconds(60)), 1);
        assert_eq!(bucket.window_start, start + Duration::seconds(60));
    }

    #[test]
    fn test_bucket_goes_stale_one_window_after_closing() {
        let start = Utc::now();
        let bucket = RateLimitBucket::open("k", Duration::hours(1), start);
        assert!(!bucket.is_stale(start + Duration::minutes(90)));
        assert!(bucket.is_stale(start + Duration::hours(2)));
    }
}
