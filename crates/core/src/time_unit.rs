//! Time units for eviction timeouts and window periods
//!
//! Callers express thresholds as `(amount, unit)` pairs. Unit names accept the
//! upper-case spelling used in configuration files (`"SECONDS"`) as well as
//! lower case.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Unit of an amount of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimeUnit {
    /// Milliseconds
    #[serde(alias = "milliseconds")]
    Milliseconds,
    /// Seconds (default)
    #[default]
    #[serde(alias = "seconds")]
    Seconds,
    /// Minutes
    #[serde(alias = "minutes")]
    Minutes,
    /// Hours
    #[serde(alias = "hours")]
    Hours,
    /// Days
    #[serde(alias = "days")]
    Days,
}

impl TimeUnit {
    /// Milliseconds in one unit
    const fn millis_per_unit(self) -> u64 {
        match self {
            TimeUnit::Milliseconds => 1,
            TimeUnit::Seconds => 1_000,
            TimeUnit::Minutes => 60_000,
            TimeUnit::Hours => 3_600_000,
            TimeUnit::Days => 86_400_000,
        }
    }

    /// Convert `amount` of this unit to a `Duration`, saturating on overflow
    pub fn to_duration(self, amount: u64) -> Duration {
        Duration::from_millis(amount.saturating_mul(self.millis_per_unit()))
    }

    /// Canonical upper-case name
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Milliseconds => "MILLISECONDS",
            TimeUnit::Seconds => "SECONDS",
            TimeUnit::Minutes => "MINUTES",
            TimeUnit::Hours => "HOURS",
            TimeUnit::Days => "DAYS",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "MILLISECONDS" | "MS" => Ok(TimeUnit::Milliseconds),
            "SECONDS" | "S" => Ok(TimeUnit::Seconds),
            "MINUTES" | "M" => Ok(TimeUnit::Minutes),
            "HOURS" | "H" => Ok(TimeUnit::Hours),
            "DAYS" | "D" => Ok(TimeUnit::Days),
            other => Err(format!("unknown time unit '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_duration() {
        assert_eq!(TimeUnit::Seconds.to_duration(30), Duration::from_secs(30));
        assert_eq!(TimeUnit::Minutes.to_duration(2), Duration::from_secs(120));
        assert_eq!(TimeUnit::Milliseconds.to_duration(0), Duration::ZERO);
        assert_eq!(
            TimeUnit::Days.to_duration(u64::MAX),
            Duration::from_millis(u64::MAX)
        );
    }

    #[test]
    fn test_parse() {
        assert_eq!("SECONDS".parse::<TimeUnit>().unwrap(), TimeUnit::Seconds);
        assert_eq!("hours".parse::<TimeUnit>().unwrap(), TimeUnit::Hours);
        assert!("fortnights".parse::<TimeUnit>().is_err());
    }

    #[test]
    fn test_serde_accepts_both_spellings() {
        let upper: TimeUnit = serde_json::from_str("\"MINUTES\"").unwrap();
        let lower: TimeUnit = serde_json::from_str("\"minutes\"").unwrap();
        assert_eq!(upper, TimeUnit::Minutes);
        assert_eq!(lower, TimeUnit::Minutes);
        assert_eq!(serde_json::to_string(&TimeUnit::Days).unwrap(), "\"DAYS\"");
    }
}
