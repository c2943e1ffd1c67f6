use std::{fmt, str::FromStr, time::Duration};

use nori_common::{
    humantime_utils::parse_millis,
    time_utils::{add_months, floor_millis, floor_months, from_millis, to_millis},
};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A bucket width: either a fixed number of milliseconds or a number of calendar months.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    Millis(i64),
    Months(u32),
}

impl Interval {
    pub fn is_calendar(&self) -> bool {
        matches!(self, Interval::Months(..))
    }

    /// Programmatically built intervals can carry a width the parser would refuse.
    pub fn is_empty(&self) -> bool {
        matches!(self, Interval::Millis(..=0) | Interval::Months(0))
    }

    pub fn millis(&self) -> Option<i64> {
        match self {
            Interval::Millis(ms) => Some(*ms),
            Interval::Months(..) => None,
        }
    }

    /// Calendar intervals the store can bucket natively.
    pub fn native_calendar_token(&self) -> Option<&'static str> {
        match self {
            Interval::Months(1) => Some("month"),
            Interval::Months(12) => Some("year"),
            _ => None,
        }
    }

    /// Start of the interval containing `dt`, with boundaries shifted by `offset_ms`.
    pub fn floor(&self, dt: OffsetDateTime, offset_ms: i64) -> Result<OffsetDateTime, String> {
        if self.is_empty() {
            return Err(format!("interval '{self}' has no width"));
        }
        match self {
            Interval::Millis(width) => {
                from_millis(floor_millis(to_millis(dt), *width, offset_ms))
            }
            Interval::Months(months) => {
                let shift = time::Duration::milliseconds(offset_ms);
                Ok(floor_months(dt - shift, *months) + shift)
            }
        }
    }

    pub fn advance(&self, dt: OffsetDateTime) -> OffsetDateTime {
        match self {
            Interval::Millis(width) => dt + time::Duration::milliseconds(*width),
            Interval::Months(months) => add_months(dt, *months),
        }
    }
}

impl FromStr for Interval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (count, unit) = s.split_at(split);

        if let Ok(count) = count.parse::<u32>() {
            let months = match unit.trim() {
                "M" | "mo" | "month" | "months" => Some(count),
                "y" | "Y" | "year" | "years" => count.checked_mul(12),
                _ => None,
            };
            if let Some(months) = months {
                if months == 0 {
                    return Err(format!("interval '{s}' must not be empty"));
                }
                return Ok(Interval::Months(months));
            }
        }

        match parse_millis(s)? {
            0 => Err(format!("interval '{s}' must not be empty")),
            ms => Ok(Interval::Millis(ms)),
        }
    }
}

impl TryFrom<String> for Interval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Interval::Millis(ms) => write!(
                f,
                "{}",
                humantime::format_duration(Duration::from_millis(*ms as u64))
            ),
            Interval::Months(months) if months % 12 == 0 => write!(f, "{}y", months / 12),
            Interval::Months(months) => write!(f, "{months}M"),
        }
    }
}

/// Phase of the bucket boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceOn {
    Offset(Interval),
    Moment(#[serde(with = "time::serde::rfc3339")] OffsetDateTime),
}

impl ReduceOn {
    pub fn is_calendar(&self) -> bool {
        matches!(self, ReduceOn::Offset(interval) if interval.is_calendar())
    }

    /// Boundary offset in milliseconds for buckets of width `every`. A moment becomes its
    /// distance from its own bucket start. `None` when the offset itself is calendar based.
    pub fn offset_millis(&self, every: &Interval) -> Option<i64> {
        match self {
            ReduceOn::Offset(interval) => interval.millis(),
            ReduceOn::Moment(moment) => {
                let start = every.floor(*moment, 0).ok()?;
                Some(to_millis(*moment) - to_millis(start))
            }
        }
    }
}
