//! Time utilities for hostdeck

use chrono::{DateTime, Utc};
use std::time::Duration;

/// Layout used inside job ids (`backup-2026-02-05T10-00-00`)
const ID_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H-%M-%S";

/// Current wall-clock time
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Render a timestamp in the filesystem-safe layout used by job ids
pub fn id_timestamp(at: DateTime<Utc>) -> String {
    at.format(ID_TIMESTAMP_FORMAT).to_string()
}

/// Whole seconds elapsed since `since`; zero if `since` is in the future
pub fn elapsed_secs(since: DateTime<Utc>) -> u64 {
    (now() - since).num_seconds().max(0) as u64
}

/// Human-readable rendering of a duration, e.g. `2h 5m` or `42s`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (days, hours, mins, secs) = (
        secs / 86_400,
        (secs % 86_400) / 3_600,
        (secs % 3_600) / 60,
        secs % 60,
    );

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m {}s", mins, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_id_timestamp_has_no_colons() {
        let at = Utc.with_ymd_and_hms(2026, 2, 5, 10, 0, 7).unwrap();
        assert_eq!(id_timestamp(at), "2026-02-05T10-00-07");
    }

    #[test]
    fn test_elapsed_future_is_zero() {
        let future = now() + chrono::Duration::seconds(100);
        assert_eq!(elapsed_secs(future), 0);
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(125)), "2m 5s");
        assert_eq!(format_duration(Duration::from_secs(7_500)), "2h 5m");
        assert_eq!(format_duration(Duration::from_secs(90_000)), "1d 1h");
    }
}
