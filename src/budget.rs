//! Time budget — cumulative runtime limit for time-sharing tasks
//!
//! A time-sharing task may need several scheduler invocations to finish a
//! unit of work. The budget is charged before each call: fixed-rate tasks pay
//! in logical trigger time, everything else pays in real elapsed time, so a
//! fixed-rate task is never charged for scheduler jitter. A call goes ahead
//! only while a full period of budget is left.
//!
//! Author: Moroya Sakamoto

/// Remaining allowed runtime of a periodic task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBudget {
    /// Time left before the task must give up (nanoseconds)
    time_left: i64,
    /// Trigger time the budget was last charged at
    last_trigger_time: i64,
}

impl TimeBudget {
    /// Budget of `total` nanoseconds, counted from `start`
    pub const fn new(total: i64, start: i64) -> Self {
        Self {
            time_left: total,
            last_trigger_time: start,
        }
    }

    /// Charge the time elapsed since the previous call.
    ///
    /// `period > 0` (fixed-rate) charges logical time, anything else charges
    /// real time.
    pub fn before_call(&mut self, real_trigger_time: i64, logical_trigger_time: i64, period: i64) {
        let now = if period > 0 {
            logical_trigger_time
        } else {
            real_trigger_time
        };
        self.time_left = self
            .time_left
            .saturating_sub(now.saturating_sub(self.last_trigger_time));
        self.last_trigger_time = now;
    }

    /// Budget exhausted?
    pub fn is_timeout(&self) -> bool {
        self.time_left <= 0
    }

    /// Enough budget left for a run spanning `interval`?
    ///
    /// A run needs a full interval of budget, so a budget `T` with interval
    /// `P` allows `floor(T / P)` runs.
    pub fn covers(&self, interval: i64) -> bool {
        !self.is_timeout() && self.time_left >= interval
    }

    /// Remaining time (may be negative once exhausted)
    pub fn time_left(&self) -> i64 {
        self.time_left
    }

    /// Time the budget was last charged at
    pub fn last_trigger_time(&self) -> i64 {
        self.last_trigger_time
    }

    /// Shorten `interval` so the next call lands no later than budget expiry
    pub fn clamp_interval(&self, interval: i64) -> i64 {
        interval.min(self.time_left.max(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_rate_charges_logical_time() {
        let mut budget = TimeBudget::new(1000, 0);
        // Real trigger lagged by 70, logical trigger is on time
        budget.before_call(370, 300, 100);
        assert_eq!(budget.time_left(), 700);
        assert_eq!(budget.last_trigger_time(), 300);
    }

    #[test]
    fn test_fixed_delay_charges_real_time() {
        let mut budget = TimeBudget::new(1000, 0);
        budget.before_call(370, 300, -100);
        assert_eq!(budget.time_left(), 630);
        assert_eq!(budget.last_trigger_time(), 370);
    }

    #[test]
    fn test_timeout() {
        let mut budget = TimeBudget::new(200, 0);
        budget.before_call(100, 100, 100);
        assert!(!budget.is_timeout());
        budget.before_call(200, 200, 100);
        assert!(budget.is_timeout());
        assert_eq!(budget.time_left(), 0);
    }

    #[test]
    fn test_covers_needs_a_full_interval() {
        let mut budget = TimeBudget::new(35, 0);
        assert!(budget.covers(10));
        budget.before_call(20, 20, -10);
        assert!(budget.covers(10));
        budget.before_call(30, 30, -10);
        assert_eq!(budget.time_left(), 5);
        assert!(!budget.is_timeout());
        assert!(!budget.covers(10));
    }

    #[test]
    fn test_covers_rejects_exhausted_budget() {
        let mut budget = TimeBudget::new(10, 0);
        budget.before_call(10, 10, 10);
        assert!(!budget.covers(0));
    }

    #[test]
    fn test_clamp_interval() {
        let mut budget = TimeBudget::new(250, 0);
        assert_eq!(budget.clamp_interval(100), 100);
        budget.before_call(200, 200, -100);
        assert_eq!(budget.clamp_interval(100), 50);
        budget.before_call(400, 400, -100);
        assert_eq!(budget.clamp_interval(100), 0);
    }
}
