//! Millisecond-precision timestamp type
//!
//! Event, creation and completion times are stored as milliseconds since the
//! Unix epoch. Arithmetic is explicit and saturating; conversions to
//! `chrono::DateTime<Utc>` are provided for consumers that want calendar time.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Unix epoch (1970-01-01 00:00:00 UTC)
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Current system time. Falls back to epoch if the clock is before 1970.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_millis() as u64)
    }

    /// Create a timestamp from milliseconds since epoch
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Create a timestamp from seconds since epoch
    #[inline]
    pub const fn from_secs(secs: u64) -> Self {
        Timestamp(secs.saturating_mul(1_000))
    }

    /// Milliseconds since epoch
    #[inline]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Elapsed time since `earlier`, or zero if `earlier` is in the future
    pub fn saturating_duration_since(&self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    /// Add a duration, saturating at `u64::MAX` milliseconds
    pub fn saturating_add(&self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_add(millis))
    }

    /// Subtract a duration, saturating at epoch
    pub fn saturating_sub(&self, duration: Duration) -> Self {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.0.saturating_sub(millis))
    }

    /// Calendar time in UTC
    pub fn to_datetime(&self) -> DateTime<Utc> {
        let millis = i64::try_from(self.0).unwrap_or(i64::MAX);
        Utc.timestamp_millis_opt(millis)
            .single()
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Value as stored in an SQLite INTEGER column
    pub(crate) fn to_sql_millis(self) -> i64 {
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }
}

impl From<i64> for Timestamp {
    /// Negative values (pre-epoch) clamp to epoch.
    fn from(millis: i64) -> Self {
        Timestamp(u64::try_from(millis).unwrap_or(0))
    }
}

impl From<Timestamp> for i64 {
    fn from(ts: Timestamp) -> Self {
        ts.to_sql_millis()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_datetime().to_rfc3339())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_since_saturates() {
        let early = Timestamp::from_secs(10);
        let late = Timestamp::from_secs(40);
        assert_eq!(late.saturating_duration_since(early), Duration::from_secs(30));
        assert_eq!(early.saturating_duration_since(late), Duration::ZERO);
    }

    #[test]
    fn test_add_and_sub() {
        let ts = Timestamp::from_millis(1_500);
        assert_eq!(ts.saturating_add(Duration::from_millis(500)).as_millis(), 2_000);
        assert_eq!(ts.saturating_sub(Duration::from_secs(5)), Timestamp::EPOCH);
    }

    #[test]
    fn test_sql_round_trip_clamps_negative() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        let raw: i64 = ts.into();
        assert_eq!(Timestamp::from(raw), ts);
        assert_eq!(Timestamp::from(-5_i64), Timestamp::EPOCH);
    }

    #[test]
    fn test_to_datetime() {
        let ts = Timestamp::from_secs(86_400);
        assert_eq!(ts.to_datetime().to_rfc3339(), "1970-01-02T00:00:00+00:00");
    }
}
