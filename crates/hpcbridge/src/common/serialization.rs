//! Serde helpers for values stored in job files and recovery snapshots.

/// (De)serializes a [`std::time::Duration`] as a human readable string (`5m`, `24:00:00`).
pub mod human_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    use crate::common::timeutils::parse_hms_or_human_time;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse_hms_or_human_time(&value).map_err(serde::de::Error::custom)
    }
}
