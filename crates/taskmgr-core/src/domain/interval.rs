//! Interval strings such as `"30s"`, `"5m"`, `"1h"`, `"1d"`.
//!
//! Used both for recurring schedules (`TaskInstance::interval`) and for
//! definition timeouts. Persisted in its string form so documents stay
//! readable by other nodes.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::errors::TaskManagerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl IntervalUnit {
    fn suffix(self) -> char {
        match self {
            IntervalUnit::Seconds => 's',
            IntervalUnit::Minutes => 'm',
            IntervalUnit::Hours => 'h',
            IntervalUnit::Days => 'd',
        }
    }

    fn seconds(self) -> i64 {
        match self {
            IntervalUnit::Seconds => 1,
            IntervalUnit::Minutes => 60,
            IntervalUnit::Hours => 60 * 60,
            IntervalUnit::Days => 24 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Interval {
    amount: u32,
    unit: IntervalUnit,
}

impl Interval {
    pub fn seconds(amount: u32) -> Self {
        Self {
            amount,
            unit: IntervalUnit::Seconds,
        }
    }

    pub fn minutes(amount: u32) -> Self {
        Self {
            amount,
            unit: IntervalUnit::Minutes,
        }
    }

    pub fn hours(amount: u32) -> Self {
        Self {
            amount,
            unit: IntervalUnit::Hours,
        }
    }

    pub fn amount(&self) -> u32 {
        self.amount
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    /// Only reachable through the constructors; parsing rejects `"0m"`.
    pub fn is_zero(&self) -> bool {
        self.amount == 0
    }

    pub fn as_time_delta(&self) -> TimeDelta {
        TimeDelta::seconds(i64::from(self.amount) * self.unit.seconds())
    }

    /// `from + self`, saturating at the maximum representable time.
    pub fn after(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from.checked_add_signed(self.as_time_delta())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl FromStr for Interval {
    type Err = TaskManagerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TaskManagerError::Validation(format!("invalid interval \"{s}\""));

        let s = s.trim();
        let suffix = s.chars().last().ok_or_else(invalid)?;
        let unit = match suffix {
            's' => IntervalUnit::Seconds,
            'm' => IntervalUnit::Minutes,
            'h' => IntervalUnit::Hours,
            'd' => IntervalUnit::Days,
            _ => return Err(invalid()),
        };
        let digits = &s[..s.len() - suffix.len_utf8()];
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let amount: u32 = digits.parse().map_err(|_| invalid())?;
        if amount == 0 {
            return Err(invalid());
        }
        Ok(Self { amount, unit })
    }
}

impl TryFrom<String> for Interval {
    type Error = TaskManagerError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(interval: Interval) -> Self {
        interval.to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    #[rstest]
    #[case("30s", 30)]
    #[case("5m", 300)]
    #[case("2h", 7200)]
    #[case("1d", 86400)]
    #[case(" 10m ", 600)]
    fn parses_valid_intervals(#[case] input: &str, #[case] seconds: i64) {
        let interval: Interval = input.parse().unwrap();
        assert_eq!(interval.as_time_delta().num_seconds(), seconds);
    }

    #[rstest]
    #[case("")]
    #[case("m")]
    #[case("0m")]
    #[case("5")]
    #[case("5w")]
    #[case("-5m")]
    #[case("1.5m")]
    fn rejects_invalid_intervals(#[case] input: &str) {
        assert!(matches!(
            input.parse::<Interval>(),
            Err(TaskManagerError::Validation(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let interval = Interval::minutes(5);
        assert_eq!(serde_json::to_string(&interval).unwrap(), "\"5m\"");

        let back: Interval = serde_json::from_str("\"5m\"").unwrap();
        assert_eq!(back, interval);
        assert!(serde_json::from_str::<Interval>("\"5x\"").is_err());
    }

    #[test]
    fn after_adds_the_interval() {
        let t = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(
            Interval::minutes(90).after(t),
            Utc.with_ymd_and_hms(2024, 1, 1, 13, 30, 0).unwrap()
        );
    }

    #[test]
    fn zero_is_only_reachable_through_constructors() {
        assert!(Interval::seconds(0).is_zero());
        assert!(!Interval::minutes(5).is_zero());
    }
}
