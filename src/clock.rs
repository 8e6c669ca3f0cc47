use std::fmt::Debug;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of wall-clock time for window and expiry math.
///
/// Rate-limit buckets are epoch minutes and cache entries carry absolute
/// expiry timestamps, so this is wall time rather than `Instant`.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> SystemTime;

    // seconds since the unix epoch, whole
    fn unix_secs(&self) -> u64 {
        self.now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

#[cfg(test)]
pub use mock::MockClock;

#[cfg(test)]
mod mock {
    use super::Clock;
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    /// Clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        current: Arc<Mutex<SystemTime>>,
    }

    impl MockClock {
        pub fn new(start: SystemTime) -> Self {
            Self {
                current: Arc::new(Mutex::new(start)),
            }
        }

        // start at a whole number of unix seconds
        pub fn at_unix(secs: u64) -> Self {
            Self::new(UNIX_EPOCH + Duration::from_secs(secs))
        }

        pub fn advance(&self, by: Duration) {
            let mut time = self.current.lock().unwrap_or_else(|e| e.into_inner());
            *time += by;
        }

        pub fn set(&self, to: SystemTime) {
            let mut time = self.current.lock().unwrap_or_else(|e| e.into_inner());
            *time = to;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> SystemTime {
            *self.current.lock().unwrap_or_else(|e| e.into_inner())
        }
    }
}
