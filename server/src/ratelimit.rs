//! Per-`(user, action)` token buckets with minute/hour/day windows.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ActionRateLimitError;

#[derive(Debug, Clone, Copy)]
pub struct ActionLimits {
    pub per_minute: u32,
    pub per_hour: u32,
    pub per_day: u32,
}

impl Default for ActionLimits {
    fn default() -> Self {
        Self {
            per_minute: 6,
            per_hour: 60,
            per_day: 300,
        }
    }
}

#[derive(Debug)]
struct RateBucket {
    minute_count: u32,
    hour_count: u32,
    day_count: u32,
    minute_reset: Instant,
    hour_reset: Instant,
    day_reset: Instant,
}

impl RateBucket {
    fn new(now: Instant) -> Self {
        Self {
            minute_count: 0,
            hour_count: 0,
            day_count: 0,
            minute_reset: now,
            hour_reset: now,
            day_reset: now,
        }
    }

    fn roll(&mut self, now: Instant) {
        if now.duration_since(self.minute_reset) >= Duration::from_secs(60) {
            self.minute_count = 0;
            self.minute_reset = now;
        }
        if now.duration_since(self.hour_reset) >= Duration::from_secs(3600) {
            self.hour_count = 0;
            self.hour_reset = now;
        }
        if now.duration_since(self.day_reset) >= Duration::from_secs(86_400) {
            self.day_count = 0;
            self.day_reset = now;
        }
    }
}

pub struct ActionRateLimiter {
    buckets: Mutex<HashMap<(String, String), RateBucket>>,
    limits: ActionLimits,
}

impl ActionRateLimiter {
    pub fn new(limits: ActionLimits) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            limits,
        }
    }

    /// Count one action, failing when any window is exhausted.
    pub fn check(&self, user_id: &str, action: &str) -> Result<(), ActionRateLimitError> {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry((user_id.to_string(), action.to_string()))
            .or_insert_with(|| RateBucket::new(now));
        bucket.roll(now);

        if bucket.minute_count >= self.limits.per_minute {
            return Err(ActionRateLimitError {
                action: action.to_string(),
                scope: "per-minute",
                limit: self.limits.per_minute,
            });
        }
        if bucket.hour_count >= self.limits.per_hour {
            return Err(ActionRateLimitError {
                action: action.to_string(),
                scope: "per-hour",
                limit: self.limits.per_hour,
            });
        }
        if bucket.day_count >= self.limits.per_day {
            return Err(ActionRateLimitError {
                action: action.to_string(),
                scope: "per-day",
                limit: self.limits.per_day,
            });
        }

        bucket.minute_count += 1;
        bucket.hour_count += 1;
        bucket.day_count += 1;
        Ok(())
    }
}
