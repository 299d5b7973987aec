//! Shared serde helpers for configuration types

/// Serialize `std::time::Duration` as whole seconds
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "hd_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timeouts {
        #[serde(with = "duration_secs")]
        grace: Duration,
    }

    #[test]
    fn test_duration_as_integer_seconds() {
        let t = Timeouts {
            grace: Duration::from_secs(30),
        };
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"grace":30}"#);

        let parsed: Timeouts = toml::from_str("grace = 90").unwrap();
        assert_eq!(parsed.grace, Duration::from_secs(90));
    }

    #[test]
    fn test_subsecond_part_is_dropped() {
        let t = Timeouts {
            grace: Duration::from_millis(2500),
        };
        assert_eq!(serde_json::to_string(&t).unwrap(), r#"{"grace":2}"#);
    }
}
