//! Capacity budgets for request and token throughput
//!
//! Each budget refills continuously at `ceiling` units per 60 seconds and
//! never holds more than `ceiling`. Amounts are kept in unit-nanoseconds
//! (units scaled by the window length) so refills are exact integers and
//! sub-unit accrual is never lost between short sleeps.

use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Length of the window the ceilings are expressed over
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

const WINDOW_NANOS: u128 = RATE_WINDOW.as_nanos();

/// One replenishing allowance
#[derive(Debug, Clone)]
pub struct CapacityBudget {
    ceiling: u64,
    /// Spendable amount in unit-nanoseconds
    available: u128,
    last_refill_time: Instant,
}

impl CapacityBudget {
    /// Create an empty budget that starts filling at `now`
    pub fn new(ceiling: u64, now: Instant) -> Self {
        Self {
            ceiling,
            available: 0,
            last_refill_time: now,
        }
    }

    /// Create a budget that starts at its ceiling
    pub fn full(ceiling: u64, now: Instant) -> Self {
        Self {
            ceiling,
            available: ceiling as u128 * WINDOW_NANOS,
            last_refill_time: now,
        }
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Currently spendable units (fractional)
    pub fn available(&self) -> f64 {
        self.available as f64 / WINDOW_NANOS as f64
    }

    pub fn last_refill_time(&self) -> Instant {
        self.last_refill_time
    }

    fn capacity(&self) -> u128 {
        self.ceiling as u128 * WINDOW_NANOS
    }

    /// Accrue `ceiling * elapsed / 60s`, capped at the ceiling
    ///
    /// A `now` earlier than the last refill accrues nothing.
    pub fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_time);
        let accrued = (self.ceiling as u128).saturating_mul(elapsed.as_nanos());
        self.available = self.available.saturating_add(accrued).min(self.capacity());
        if now > self.last_refill_time {
            self.last_refill_time = now;
        }
    }

    fn can_spend(&self, units: u64) -> bool {
        units as u128 * WINDOW_NANOS <= self.available
    }

    fn spend(&mut self, units: u64) {
        self.available -= units as u128 * WINDOW_NANOS;
    }

    /// Time until `units` will be spendable, assuming no other spending
    pub fn time_until(&self, units: u64) -> Duration {
        let units = units.min(self.ceiling);
        let needed = (units as u128 * WINDOW_NANOS).saturating_sub(self.available);
        if needed == 0 {
            return Duration::ZERO;
        }
        let nanos = needed.div_ceil(self.ceiling as u128);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

/// Tracks the request-count and token-count budgets together
#[derive(Debug, Clone)]
pub struct CapacityTracker {
    requests: CapacityBudget,
    tokens: CapacityBudget,
}

impl CapacityTracker {
    /// Create a tracker whose budgets start empty at `now`
    pub fn new(max_requests_per_minute: u64, max_tokens_per_minute: u64, now: Instant) -> Self {
        debug!(%max_requests_per_minute, %max_tokens_per_minute, "CapacityTracker::new: called");
        Self {
            requests: CapacityBudget::new(max_requests_per_minute, now),
            tokens: CapacityBudget::new(max_tokens_per_minute, now),
        }
    }

    /// Create a tracker from explicit budgets
    pub fn from_budgets(requests: CapacityBudget, tokens: CapacityBudget) -> Self {
        Self { requests, tokens }
    }

    pub fn requests(&self) -> &CapacityBudget {
        &self.requests
    }

    pub fn tokens(&self) -> &CapacityBudget {
        &self.tokens
    }

    /// Bring both budgets up to date with `now`
    pub fn replenish(&mut self, now: Instant) {
        self.requests.replenish(now);
        self.tokens.replenish(now);
    }

    /// Reserve capacity for one admission
    ///
    /// Either both budgets are decremented or neither is. A cost above a
    /// budget's ceiling is clamped to the ceiling so an oversized job waits
    /// for a full window instead of never being admitted.
    pub fn try_reserve(&mut self, request_cost: u64, token_cost: u64) -> bool {
        let request_cost = request_cost.min(self.requests.ceiling);
        let token_cost = token_cost.min(self.tokens.ceiling);

        if !self.requests.can_spend(request_cost) || !self.tokens.can_spend(token_cost) {
            return false;
        }

        self.requests.spend(request_cost);
        self.tokens.spend(token_cost);
        true
    }

    /// Lower bound on how long until a reservation of this size can succeed
    pub fn time_until(&self, request_cost: u64, token_cost: u64) -> Duration {
        self.requests
            .time_until(request_cost)
            .max(self.tokens.time_until(token_cost))
    }
}
