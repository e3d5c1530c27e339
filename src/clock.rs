use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};

/// Injected time source. Every wall-clock read in the engine goes through
/// this trait so cooldown tests can advance time deterministically instead
/// of sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock whose time is set by the test, not the wall.
#[derive(Clone)]
pub struct FakeClock {
    inner: Arc<Mutex<DateTime<Utc>>>,
}

impl FakeClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        FakeClock {
            inner: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut guard = self.inner.lock().expect("fake clock mutex poisoned");
        *guard += delta;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        let mut guard = self.inner.lock().expect("fake clock mutex poisoned");
        *guard = at;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> DateTime<Utc> {
        *self.inner.lock().expect("fake clock mutex poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_fake_clock_advances() {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let clock = FakeClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(chrono::Duration::seconds(300));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(300));
    }
}
