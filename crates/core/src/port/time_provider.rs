// Time Provider Port (for testability)

use chrono::{DateTime, NaiveDate, Utc};

/// Time provider interface (allows mocking in tests)
pub trait TimeProvider: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    /// Epoch milliseconds, used by the job queue
    fn now_millis(&self) -> i64 {
        self.now().timestamp_millis()
    }

    fn today(&self) -> NaiveDate {
        self.now().date_naive()
    }
}

/// System time provider (production)
pub struct SystemTimeProvider;

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub mod mocks {
    use super::*;
    use std::sync::Mutex;

    /// Manually driven clock
    pub struct FixedTimeProvider {
        now: Mutex<DateTime<Utc>>,
    }

    impl FixedTimeProvider {
        pub fn new(now: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(now),
            }
        }

        pub fn set(&self, now: DateTime<Utc>) {
            *self.now.lock().unwrap() = now;
        }

        pub fn advance(&self, by: chrono::Duration) {
            let mut now = self.now.lock().unwrap();
            *now += by;
        }
    }

    impl TimeProvider for FixedTimeProvider {
        fn now(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}
