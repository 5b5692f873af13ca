//! Per-second budget for originated control messages (RREQ_RATELIMIT / RERR_RATELIMIT).
use chrono::{DateTime, Duration, Utc};

#[derive(Debug)]
pub struct RateLimiter {
    /// Messages allowed per window. Zero disables the limit.
    limit: u32,
    window: Duration,
    window_start: Option<DateTime<Utc>>,
    sent: u32,
}

impl RateLimiter {
    pub fn per_second(limit: u32) -> Self {
        RateLimiter {
            limit,
            window: Duration::seconds(1),
            window_start: None,
            sent: 0,
        }
    }

    /// Consumes one unit of budget if there is any left in the current window.
    pub fn try_acquire(&mut self, now: DateTime<Utc>) -> bool {
        if self.limit == 0 {
            return true;
        }
        match self.window_start {
            Some(start) if now - start < self.window => {}
            _ => {
                self.window_start = Some(now);
                self.sent = 0;
            }
        }
        if self.sent >= self.limit {
            return false;
        }
        self.sent += 1;
        true
    }

    /// Time until the current window closes.
    pub fn retry_after(&self, now: DateTime<Utc>) -> Duration {
        match self.window_start {
            Some(start) if now - start < self.window => self.window - (now - start),
            _ => Duration::zero(),
        }
    }
}
