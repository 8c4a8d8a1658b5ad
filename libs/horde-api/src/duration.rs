//! Serde adapters reading durations as integer milliseconds, so that config
//! files can say `cache_timeout_ms = 500`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        (value.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Same as [`millis`] for optional values; `0` reads as `None` (unlimited).
pub mod opt_millis {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<u64>::deserialize(deserializer)?;
        Ok(raw.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
