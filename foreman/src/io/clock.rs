//! Wall-clock seam so deadline logic is deterministic in tests.

use chrono::{DateTime, Utc};

/// Source of the current wall-clock time.
pub trait TimeSource {
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock.
pub struct SystemClock;

impl TimeSource for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
