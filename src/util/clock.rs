use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use parking_lot::RwLock;

/// Injectable time source.
///
/// All time-of-day logic (tariff zones, peak hours, night hours, daily
/// resets) goes through this trait so the decision engines never read the
/// wall clock directly.
pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    fn timezone(&self) -> Tz;

    fn now_local(&self) -> DateTime<Tz> {
        self.now_utc().with_timezone(&self.timezone())
    }
}

/// Wall-clock time in a configured local timezone.
pub struct SystemClock {
    tz: Tz,
}

impl SystemClock {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Europe::Warsaw,
        }
    }
}

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}

/// Settable clock for tests and deterministic simulation runs.
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
    tz: Tz,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
            tz: chrono_tz::Europe::Warsaw,
        }
    }

    pub fn with_timezone(now: DateTime<Utc>, tz: Tz) -> Self {
        Self {
            now: RwLock::new(now),
            tz,
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.write() = now;
    }

    pub fn advance(&self, delta: chrono::Duration) {
        let mut now = self.now.write();
        *now += delta;
    }
}

impl Clock for FixedClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.now.read()
    }

    fn timezone(&self) -> Tz {
        self.tz
    }
}
