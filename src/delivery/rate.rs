//! Rate budgets for the delivery queue: a continuously refilling token
//! bucket capping aggregate throughput, plus a minimum spacing between
//! sends to the same recipient.

use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// Continuous-refill token bucket. `try_take` is O(1).
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity: capacity as f64,
            tokens: capacity as f64,
            refill_per_sec,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Takes one token if available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// How long until one token will be available, zero if one already is.
    pub fn time_until_ready(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - self.tokens) / self.refill_per_sec)
        }
    }
}

/// Combined eligibility check for one delivery: per-recipient spacing and
/// the global bucket. Mutated under the queue's lock only.
#[derive(Debug)]
pub struct RateBudget {
    spacing: Duration,
    global: TokenBucket,
    last_sent: HashMap<i64, Instant>,
}

impl RateBudget {
    pub fn new(spacing: Duration, global_rate_per_sec: f64, global_burst: u32) -> Self {
        Self {
            spacing,
            global: TokenBucket::new(global_burst, global_rate_per_sec, Instant::now()),
            last_sent: HashMap::new(),
        }
    }

    /// Checks eligibility without consuming anything. On failure returns a
    /// hint for how long to wait before the recipient could be eligible.
    pub fn check(&mut self, recipient: i64, now: Instant) -> Result<(), Duration> {
        if let Some(last) = self.last_sent.get(&recipient) {
            let since = now.saturating_duration_since(*last);
            if since < self.spacing {
                return Err(self.spacing - since);
            }
        }
        let wait = self.global.time_until_ready(now);
        if wait > Duration::ZERO {
            return Err(wait);
        }
        Ok(())
    }

    /// Consumes the budget for one send. Called at take time so the
    /// configured rates bound send starts even when sends are slow.
    pub fn commit(&mut self, recipient: i64, now: Instant) {
        self.global.try_take(now);
        self.last_sent.insert(recipient, now);
    }
}
