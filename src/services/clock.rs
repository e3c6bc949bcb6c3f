//! Wall-clock access for the scheduler and the replication queue.
//!
//! Everything time-driven reads the clock through [`Clock`] so that tests can
//! walk across hour and day boundaries without sleeping.

use chrono::{DateTime, Local, NaiveDateTime, Utc};

pub trait Clock: Send + Sync + 'static {
    /// Current instant, used for every stored timestamp.
    fn now(&self) -> DateTime<Utc>;

    /// Local wall-clock time, used for trigger hours and filename suffixes.
    fn local_now(&self) -> NaiveDateTime {
        self.now().with_timezone(&Local).naive_local()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests. Local time is UTC.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock(std::sync::Mutex<DateTime<Utc>>);

#[cfg(test)]
impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self(std::sync::Mutex::new(now))
    }

    pub fn advance(&self, by: chrono::TimeDelta) {
        *self.0.lock().unwrap() += by;
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap()
    }

    fn local_now(&self) -> NaiveDateTime {
        self.now().naive_utc()
    }
}
