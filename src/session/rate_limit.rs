//! Per-session token-bucket rate limiting with exponential back-off.

use chrono::{DateTime, Duration, Utc};

/// Window length for the command counter.
const WINDOW_SECS: i64 = 60;

/// Back-off is capped at one window.
const MAX_BACKOFF_SECS: u64 = 60;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// The command may proceed to replay checking.
    Admitted,
    /// Rejected; the client must wait this many seconds.
    Limited {
        /// Whole seconds remaining until the back-off lifts, rounded up.
        retry_after_secs: u64,
    },
}

/// Mutable rate-limit state carried by each session.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    count: u32,
    window_reset_at: DateTime<Utc>,
    penalty_level: u32,
    backoff_until: Option<DateTime<Utc>>,
}

impl RateLimitState {
    /// Fresh state with an open window starting now.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            count: 0,
            window_reset_at: now + Duration::seconds(WINDOW_SECS),
            penalty_level: 0,
            backoff_until: None,
        }
    }

    /// Evaluate one command against the limiter.
    ///
    /// Order: active back-off first, then window roll (decaying the penalty
    /// level by one, floor zero), then the counter. Exceeding `max_per_minute`
    /// raises the penalty level and imposes `min(60, 2^level)` seconds of
    /// back-off.
    pub fn check(&mut self, now: DateTime<Utc>, max_per_minute: u32) -> RateDecision {
        if let Some(until) = self.backoff_until {
            if now < until {
                return RateDecision::Limited {
                    retry_after_secs: remaining_secs(now, until),
                };
            }
            self.backoff_until = None;
        }

        // A command landing exactly on the window edge counts against a
        // fresh window.
        if now >= self.window_reset_at {
            self.count = 0;
            self.window_reset_at = now + Duration::seconds(WINDOW_SECS);
            self.penalty_level = self.penalty_level.saturating_sub(1);
        }

        self.count += 1;
        if self.count > max_per_minute {
            self.penalty_level += 1;
            let backoff = MAX_BACKOFF_SECS.min(1u64 << self.penalty_level.min(6));
            let until = now + Duration::seconds(backoff as i64);
            self.backoff_until = Some(until);
            self.count = 0;
            self.window_reset_at = now + Duration::seconds(WINDOW_SECS);
            return RateDecision::Limited {
                retry_after_secs: backoff,
            };
        }

        RateDecision::Admitted
    }

    /// Current penalty level, exposed for observability.
    #[must_use]
    pub fn penalty_level(&self) -> u32 {
        self.penalty_level
    }
}

fn remaining_secs(now: DateTime<Utc>, until: DateTime<Utc>) -> u64 {
    let millis = (until - now).num_milliseconds().max(0) as u64;
    millis.div_ceil(1000)
}
