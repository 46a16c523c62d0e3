//! Duration helpers shared by job records and settings.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Convert a std duration to a chrono duration, saturating at `i64::MAX` ms.
pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    let millis = i64::try_from(duration.as_millis()).unwrap_or(i64::MAX);
    chrono::Duration::milliseconds(millis)
}

/// Milliseconds from a chrono duration, clamped at zero.
pub(crate) fn millis_until(delta: chrono::Duration) -> u64 {
    u64::try_from(delta.num_milliseconds()).unwrap_or(0)
}

/// Serialize a [`Duration`] as integer milliseconds.
pub mod millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serialize an optional [`Duration`] as integer seconds.
pub mod option_secs {
    use super::*;

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match duration {
            Some(d) => serializer.serialize_some(&d.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}
