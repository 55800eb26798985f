//! Time source shared by the stores and the aggregation policy.
//!
//! Group timestamps are stamped by the clock handed to the store, never taken
//! from an arrival's `received_at`, so a caller cannot age a group by lying.
//! That clock is this process's `Utc::now()`. Processes sharing one SQLite
//! file therefore need to run on one host (or under tight clock sync): skew
//! between them moves the stale and quick thresholds by the same amount.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock for tests, benches, and replay tooling.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Clock pinned to the Unix epoch plus `secs`.
    pub fn at_secs(secs: i64) -> Self {
        Self::new(DateTime::<Utc>::from_timestamp(secs, 0).unwrap_or_default())
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = self.now.lock();
        *now += by;
    }

    pub fn advance_secs(&self, secs: i64) {
        self.advance(ChronoDuration::seconds(secs));
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

pub type SharedClock = Arc<dyn Clock>;

pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
