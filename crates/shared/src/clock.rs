//! Time source abstraction
//!
//! Bucket refill, quota resets, audit retention and key grace periods are all
//! computed lazily from "now", so every component reads time through [`Clock`].

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// Source of the current wall-clock time
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Real system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Shared handle to the system clock
pub fn system_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

/// Whole seconds as a [`Duration`], clamped to the largest representable span
pub fn duration_secs(secs: u64) -> Duration {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or(Duration::MAX)
}

/// Whole days as a [`Duration`], clamped to the largest representable span
pub fn duration_days(days: u64) -> Duration {
    i64::try_from(days)
        .ok()
        .and_then(Duration::try_days)
        .unwrap_or(Duration::MAX)
}

/// `at + by`, clamped to the representable date range
pub fn saturating_add(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_add_signed(by).unwrap_or(if by < Duration::zero() {
        DateTime::<Utc>::MIN_UTC
    } else {
        DateTime::<Utc>::MAX_UTC
    })
}

/// `at - by`, clamped to the representable date range
pub fn saturating_sub(at: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    at.checked_sub_signed(by).unwrap_or(if by < Duration::zero() {
        DateTime::<Utc>::MAX_UTC
    } else {
        DateTime::<Utc>::MIN_UTC
    })
}

/// Manually driven clock for tests and simulations
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Start at the current system time
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
