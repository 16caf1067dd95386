//! Serde helpers that store `Duration` values as fractional seconds.
//!
//! Workflow definitions are written by hand in YAML and read back from the
//! state store as JSON, so a plain number (`1.5`) is used on the wire instead
//! of serde's default `{ secs, nanos }` struct.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn from_secs<'de, D>(secs: f64) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    if !secs.is_finite() || secs < 0.0 {
        return Err(serde::de::Error::custom(format!(
            "duration must be a non-negative number of seconds, got {}",
            secs
        )));
    }
    Ok(Duration::from_secs_f64(secs))
}

pub mod secs {
    use super::*;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        from_secs::<D>(secs)
    }
}

pub mod option_secs {
    use super::*;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => from_secs::<D>(secs).map(Some),
            None => Ok(None),
        }
    }
}
