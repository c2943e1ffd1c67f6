use serde_json::Value;
use time::{Date, Month, OffsetDateTime, format_description::well_known::Rfc3339};

pub fn parse_timestamp(timestamp: i64) -> Result<OffsetDateTime, String> {
    const MIN_TIMESTAMP_SECONDS: i64 = 72_057_595;
    const MAX_TIMESTAMP_SECONDS: i64 = 8_589_934_591;

    const MIN_TIMESTAMP_MILLIS: i64 = MIN_TIMESTAMP_SECONDS * 1000;
    const MAX_TIMESTAMP_MILLIS: i64 = MAX_TIMESTAMP_SECONDS * 1000;
    const MIN_TIMESTAMP_MICROS: i64 = MIN_TIMESTAMP_SECONDS * 1_000_000;
    const MAX_TIMESTAMP_MICROS: i64 = MAX_TIMESTAMP_SECONDS * 1_000_000;
    const MIN_TIMESTAMP_NANOS: i64 = MIN_TIMESTAMP_SECONDS * 1_000_000_000;
    const MAX_TIMESTAMP_NANOS: i64 = MAX_TIMESTAMP_SECONDS * 1_000_000_000;

    match timestamp {
        MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS => {
            OffsetDateTime::from_unix_timestamp(timestamp)
                .map_err(|e| format!("failed to parse unix timestamp seconds: {}", e))
        }
        MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS => {
            OffsetDateTime::from_unix_timestamp_nanos(timestamp as i128 * 1_000_000)
                .map_err(|e| format!("failed to parse unix timestamp millis: {}", e))
        }
        MIN_TIMESTAMP_MICROS..=MAX_TIMESTAMP_MICROS => {
            OffsetDateTime::from_unix_timestamp_nanos(timestamp as i128 * 1_000)
                .map_err(|e| format!("failed to parse unix timestamp micros: {}", e))
        }
        MIN_TIMESTAMP_NANOS..=MAX_TIMESTAMP_NANOS => {
            OffsetDateTime::from_unix_timestamp_nanos(timestamp as i128)
                .map_err(|e| format!("failed to parse unix timestamp nanos: {}", e))
        }
        _ => Err(format!(
            "failed to parse unix timestamp `{timestamp}`. Supported timestamp ranges \
             from `13 Apr 1972 23:59:55` to `16 Mar 2242 12:56:31`"
        )),
    }
}

pub fn parse_timestamp_float(timestamp: f64) -> Result<OffsetDateTime, String> {
    const MIN_TIMESTAMP_SECONDS: f64 = 72_057_595.0;
    const MAX_TIMESTAMP_SECONDS: f64 = 8_589_934_591.0;

    const MIN_TIMESTAMP_MILLIS: f64 = MIN_TIMESTAMP_SECONDS * 1000.0;
    const MAX_TIMESTAMP_MILLIS: f64 = MAX_TIMESTAMP_SECONDS * 1000.0;
    const MIN_TIMESTAMP_MICROS: f64 = MIN_TIMESTAMP_SECONDS * 1_000_000.0;
    const MAX_TIMESTAMP_MICROS: f64 = MAX_TIMESTAMP_SECONDS * 1_000_000.0;

    if (MIN_TIMESTAMP_SECONDS..=MAX_TIMESTAMP_SECONDS).contains(&timestamp) {
        let whole = timestamp.trunc();
        let fract = timestamp.fract();
        let nanos = (whole as i128 * 1_000_000_000) + (fract * 1_000_000_000.0) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|e| format!("failed to parse unix timestamp seconds: {}", e))
    } else if (MIN_TIMESTAMP_MILLIS..=MAX_TIMESTAMP_MILLIS).contains(&timestamp) {
        let whole = timestamp.trunc();
        let fract = timestamp.fract();
        let nanos = (whole as i128 * 1_000_000) + (fract * 1_000_000.0) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|e| format!("failed to parse unix timestamp millis: {}", e))
    } else if (MIN_TIMESTAMP_MICROS..=MAX_TIMESTAMP_MICROS).contains(&timestamp) {
        let whole = timestamp.trunc();
        let fract = timestamp.fract();
        let nanos = (whole as i128 * 1_000) + (fract * 1_000.0) as i128;
        OffsetDateTime::from_unix_timestamp_nanos(nanos)
            .map_err(|e| format!("failed to parse unix timestamp micros: {}", e))
    } else {
        Err(format!(
            "failed to parse unix timestamp `{timestamp}`. Supported timestamp ranges \
             from `13 Apr 1972 23:59:55` to `16 Mar 2242 12:56:31`"
        ))
    }
}

/// Reads a stored time value: an RFC3339 string or a unix epoch number in any of the
/// resolutions `parse_timestamp` understands.
pub fn value_to_datetime(value: &Value) -> Result<OffsetDateTime, String> {
    match value {
        Value::String(s) => OffsetDateTime::parse(s, &Rfc3339)
            .map_err(|e| format!("failed to parse rfc3339 timestamp '{s}': {e}")),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                parse_timestamp(i)
            } else if let Some(f) = n.as_f64() {
                parse_timestamp_float(f)
            } else {
                Err(format!("unsupported timestamp number {n}"))
            }
        }
        other => Err(format!("expected a timestamp, got {other}")),
    }
}

pub fn format_rfc3339(dt: OffsetDateTime) -> String {
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| dt.unix_timestamp().to_string())
}

pub fn to_millis(dt: OffsetDateTime) -> i64 {
    (dt.unix_timestamp_nanos() / 1_000_000) as i64
}

pub fn from_millis(millis: i64) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp_nanos(millis as i128 * 1_000_000)
        .map_err(|e| format!("timestamp {millis}ms out of range: {e}"))
}

/// Drops everything below the millisecond, the finest resolution the store sorts and
/// filters dates at.
pub fn truncate_millis(dt: OffsetDateTime) -> OffsetDateTime {
    dt - time::Duration::nanoseconds((dt.nanosecond() % 1_000_000) as i64)
}

/// Largest `offset + k * width` that is `<= millis`.
pub fn floor_millis(millis: i64, width: i64, offset: i64) -> i64 {
    (millis - offset).div_euclid(width) * width + offset
}

/// Start of the calendar period of `months` months containing `dt` (months counted from
/// year 0, so 12 aligns to years).
pub fn floor_months(dt: OffsetDateTime, months: u32) -> OffsetDateTime {
    let dt = dt.to_offset(time::UtcOffset::UTC);
    let total = dt.year() as i64 * 12 + (dt.month() as i64 - 1);
    let floored = total.div_euclid(months as i64) * months as i64;
    month_start(floored)
}

pub fn add_months(dt: OffsetDateTime, months: u32) -> OffsetDateTime {
    let dt = dt.to_offset(time::UtcOffset::UTC);
    let total = dt.year() as i64 * 12 + (dt.month() as i64 - 1) + months as i64;
    let start = month_start(total);
    // Keeps intra-month position for the values produced by floor_months, which are
    // always the first instant of a month.
    start + (dt - month_start(dt.year() as i64 * 12 + (dt.month() as i64 - 1)))
}

fn month_start(total_months: i64) -> OffsetDateTime {
    let year = total_months.div_euclid(12) as i32;
    let month = Month::try_from((total_months.rem_euclid(12) + 1) as u8).unwrap_or(Month::January);
    Date::from_calendar_date(year, month, 1)
        .map(|date| date.midnight().assume_utc())
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use time::macros::datetime;

    use super::*;

    #[test]
    fn parse_values() {
        let expected = datetime!(2024-03-01 10:00:00 UTC);
        assert_eq!(value_to_datetime(&json!("2024-03-01T10:00:00Z")), Ok(expected));
        assert_eq!(value_to_datetime(&json!(1_709_287_200_000i64)), Ok(expected));
        assert_eq!(value_to_datetime(&json!(1_709_287_200)), Ok(expected));
        assert!(value_to_datetime(&json!(true)).is_err());
    }

    #[test]
    fn floor_with_offset() {
        assert_eq!(floor_millis(1_050, 100, 0), 1_000);
        assert_eq!(floor_millis(1_050, 100, 30), 1_030);
        assert_eq!(floor_millis(1_020, 100, 30), 930);
        assert_eq!(floor_millis(-50, 100, 0), -100);
    }

    #[test]
    fn months() {
        let dt = datetime!(2024-11-17 08:30:00 UTC);
        assert_eq!(floor_months(dt, 1), datetime!(2024-11-01 00:00:00 UTC));
        assert_eq!(floor_months(dt, 12), datetime!(2024-01-01 00:00:00 UTC));
        assert_eq!(
            add_months(datetime!(2024-11-01 00:00:00 UTC), 3),
            datetime!(2025-02-01 00:00:00 UTC)
        );
    }

    #[test]
    fn millis_round_trip() {
        let dt = datetime!(2024-03-01 10:00:00.250 UTC);
        assert_eq!(from_millis(to_millis(dt)), Ok(dt));
        assert_eq!(format_rfc3339(dt), "2024-03-01T10:00:00.25Z");
    }

    #[test]
    fn truncate_below_millis() {
        assert_eq!(
            truncate_millis(datetime!(2024-03-01 10:00:00.250_900 UTC)),
            datetime!(2024-03-01 10:00:00.250 UTC)
        );
        let whole = datetime!(2024-03-01 10:00:00.250 UTC);
        assert_eq!(truncate_millis(whole), whole);
    }
}
