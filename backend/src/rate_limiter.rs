use std::collections::HashMap;
use std::sync::Mutex;
use time::{Duration, OffsetDateTime};
use tracing::{error, warn};

use crate::error::ApiError;

#[derive(Debug)]
struct Window {
    attempts: u32,
    started: OffsetDateTime,
}

/// Fixed-window limiter keyed by caller (client address plus route).
#[derive(Debug)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
    max_attempts: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
            max_attempts,
            window,
        }
    }

    pub fn per_minute(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::minutes(1))
    }

    /// Counts one attempt for `key`. A limit of zero disables limiting.
    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        self.check_at(key, OffsetDateTime::now_utc())
    }

    fn check_at(&self, key: &str, now: OffsetDateTime) -> Result<(), ApiError> {
        if self.max_attempts == 0 {
            return Ok(());
        }

        let mut windows = self.windows.lock().map_err(|e| {
            error!("Failed to acquire rate limit lock: {}", e);
            ApiError::Internal
        })?;

        windows.retain(|_, w| now - w.started <= self.window * 2);

        let window = windows.entry(key.to_string()).or_insert(Window {
            attempts: 0,
            started: now,
        });

        if now - window.started > self.window {
            *window = Window { attempts: 0, started: now };
        }

        if window.attempts >= self.max_attempts {
            let seconds_to_wait = (window.started + self.window - now).whole_seconds().max(1);
            warn!("Rate limit triggered for key {}", key);
            return Err(ApiError::RateLimited(format!(
                "Rate limit exceeded. Please try again in {} seconds.",
                seconds_to_wait
            )));
        }

        window.attempts += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limits_within_window_and_resets_after() {
        let limiter = RateLimiter::per_minute(2);
        let start = OffsetDateTime::now_utc();

        assert!(limiter.check_at("vote:1.2.3.4", start).is_ok());
        assert!(limiter.check_at("vote:1.2.3.4", start + Duration::seconds(1)).is_ok());
        assert!(matches!(
            limiter.check_at("vote:1.2.3.4", start + Duration::seconds(2)),
            Err(ApiError::RateLimited(_))
        ));
        assert!(limiter.check_at("vote:5.6.7.8", start + Duration::seconds(2)).is_ok());
        assert!(limiter.check_at("vote:1.2.3.4", start + Duration::seconds(61)).is_ok());
    }

    #[test]
    fn test_zero_disables() {
        let limiter = RateLimiter::per_minute(0);
        let now = OffsetDateTime::now_utc();
        for _ in 0..100 {
            assert!(limiter.check_at("k", now).is_ok());
        }
    }
}
