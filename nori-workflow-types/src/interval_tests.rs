use std::str::FromStr;

use time::macros::datetime;

use crate::interval::{Interval, ReduceOn};

#[test]
fn parse_fixed_intervals() {
    assert_eq!(Interval::from_str("5m"), Ok(Interval::Millis(300_000)));
    assert_eq!(Interval::from_str("250ms"), Ok(Interval::Millis(250)));
    assert_eq!(Interval::from_str("1d"), Ok(Interval::Millis(86_400_000)));
}

#[test]
fn parse_calendar_intervals() {
    assert_eq!(Interval::from_str("1M"), Ok(Interval::Months(1)));
    assert_eq!(Interval::from_str("3 months"), Ok(Interval::Months(3)));
    assert_eq!(Interval::from_str("1y"), Ok(Interval::Months(12)));
    assert!(Interval::from_str("0M").is_err());
    assert!(Interval::from_str("later").is_err());
}

#[test]
fn native_calendar_tokens() {
    assert_eq!(Interval::Months(1).native_calendar_token(), Some("month"));
    assert_eq!(Interval::Months(12).native_calendar_token(), Some("year"));
    assert_eq!(Interval::Months(2).native_calendar_token(), None);
    assert_eq!(Interval::Millis(1000).native_calendar_token(), None);
}

#[test]
fn display_parses_back() {
    for interval in [Interval::Millis(90_000), Interval::Months(2), Interval::Months(24)] {
        assert_eq!(Interval::from_str(&interval.to_string()), Ok(interval));
    }
}

#[test]
fn floor_and_advance() {
    let dt = datetime!(2024-05-10 10:17:00 UTC);
    let hour = Interval::Millis(3_600_000);
    assert_eq!(hour.floor(dt, 0), Ok(datetime!(2024-05-10 10:00:00 UTC)));
    assert_eq!(hour.floor(dt, 1_200_000), Ok(datetime!(2024-05-10 09:20:00 UTC)));
    assert_eq!(hour.advance(dt), datetime!(2024-05-10 11:17:00 UTC));

    let month = Interval::Months(1);
    assert_eq!(month.floor(dt, 0), Ok(datetime!(2024-05-01 00:00:00 UTC)));
    assert_eq!(
        month.advance(datetime!(2024-12-01 00:00:00 UTC)),
        datetime!(2025-01-01 00:00:00 UTC)
    );
}

#[test]
fn moment_offsets() {
    let hour = Interval::Millis(3_600_000);
    let on = ReduceOn::Moment(datetime!(2020-01-01 00:15:00 UTC));
    assert_eq!(on.offset_millis(&hour), Some(900_000));
    assert_eq!(ReduceOn::Offset(Interval::Millis(5)).offset_millis(&hour), Some(5));
    assert!(ReduceOn::Offset(Interval::Months(1)).is_calendar());
    assert_eq!(ReduceOn::Offset(Interval::Months(1)).offset_millis(&hour), None);
}

#[test]
fn empty_widths_do_not_floor() {
    let dt = datetime!(2024-05-10 10:17:00 UTC);
    for every in [Interval::Millis(0), Interval::Millis(-1000), Interval::Months(0)] {
        assert!(every.is_empty(), "{every:?}");
        assert!(every.floor(dt, 0).is_err(), "{every:?}");
    }
    assert!(!Interval::Millis(1).is_empty());
    assert_eq!(
        ReduceOn::Moment(dt).offset_millis(&Interval::Millis(0)),
        None
    );
}
