use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

pub fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let s = humantime::format_duration(*duration).to_string();
    serializer.serialize_str(&s)
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    humantime::parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Parses a humantime duration ("5m", "1h 30m", "250ms") into whole milliseconds.
pub fn parse_millis(s: &str) -> Result<i64, String> {
    let duration = humantime::parse_duration(s).map_err(|e| format!("'{s}': {e}"))?;
    i64::try_from(duration.as_millis()).map_err(|_| format!("'{s}' overflows milliseconds"))
}
