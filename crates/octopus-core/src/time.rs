//! Wall clock abstraction

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock time, replaceable in tests
pub trait TimeSource: Send + Sync + fmt::Debug {
    /// Current system time
    fn system_time(&self) -> SystemTime;

    /// Time elapsed since the Unix epoch
    fn since_epoch(&self) -> Duration {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// [`TimeSource`] backed by the operating system clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }
}
