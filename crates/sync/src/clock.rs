use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Wall clock that never hands out the same or an earlier instant twice.
#[derive(Debug, Default)]
pub struct MonotonicClock {
    last: Mutex<Option<DateTime<Utc>>>,
}

impl MonotonicClock {
    pub fn now(&self) -> DateTime<Utc> {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        let mut now = Utc::now();
        if let Some(prev) = *last
            && now <= prev
        {
            now = prev + Duration::nanoseconds(1);
        }
        *last = Some(now);
        now
    }
}
