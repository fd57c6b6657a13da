use std::time::{SystemTime, UNIX_EPOCH};

/// A source of wall-clock timestamps for routing, naming and ttl decisions.
///
/// The coordinator takes its notion of "now" from this trait so that tests
/// can pin time while production uses the system clock.
pub trait Clock: Send + Sync + 'static {
    /// Current timestamp in milliseconds since the UNIX epoch.
    fn now_millis(&self) -> i64;
}

/// Default clock backed by `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let elapsed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before UNIX epoch");
        i64::try_from(elapsed.as_millis()).expect("system time exceeds timestamp range")
    }
}

/// Manually advanced clock for deterministic tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::sync::atomic::AtomicI64,
}

impl ManualClock {
    pub fn new(now: i64) -> Self {
        Self {
            now: std::sync::atomic::AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: i64) {
        self.now.store(now, std::sync::atomic::Ordering::Release);
    }

    pub fn advance(&self, delta: i64) {
        self.now
            .fetch_add(delta, std::sync::atomic::Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(std::sync::atomic::Ordering::Acquire)
    }
}
