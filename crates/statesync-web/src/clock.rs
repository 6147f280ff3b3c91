//! Device wall clock.
//!
//! Without a time server the device's notion of "now" can be set by hand.
//! The host clock is never touched; the difference is kept as an offset.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Format of `local_time` in requests and responses.
pub const LOCAL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Default)]
pub struct DeviceClock {
    offset_ms: AtomicI64,
    adjusted: AtomicBool,
}

impl DeviceClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.offset_ms.load(Ordering::Relaxed))
    }

    /// Make `now` the current time.
    pub fn set(&self, now: DateTime<Utc>) {
        let offset = (now - Utc::now()).num_milliseconds();
        self.offset_ms.store(offset, Ordering::Relaxed);
        self.adjusted.store(true, Ordering::Relaxed);
    }

    /// Whether the time was ever set by hand.
    pub fn is_adjusted(&self) -> bool {
        self.adjusted.load(Ordering::Relaxed)
    }
}

/// `utc` as wall-clock time in the IANA zone `tz_label`. Unknown zones
/// fall back to UTC.
pub fn format_local(utc: DateTime<Utc>, tz_label: &str) -> String {
    match tz_label.parse::<Tz>() {
        Ok(tz) => utc.with_timezone(&tz).format(LOCAL_TIME_FORMAT).to_string(),
        Err(_) => utc.format(LOCAL_TIME_FORMAT).to_string(),
    }
}

/// Parse a wall-clock time in the zone `tz_label`. Returns `None` for
/// malformed input and for times skipped by a daylight-saving change.
pub fn parse_local(local_time: &str, tz_label: &str) -> Option<DateTime<Utc>> {
    let naive = NaiveDateTime::parse_from_str(local_time, LOCAL_TIME_FORMAT).ok()?;
    match tz_label.parse::<Tz>() {
        Ok(tz) => match tz.from_local_datetime(&naive) {
            LocalResult::Single(t) => Some(t.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => Some(earliest.with_timezone(&Utc)),
            LocalResult::None => None,
        },
        Err(_) => Some(Utc.from_utc_datetime(&naive)),
    }
}
