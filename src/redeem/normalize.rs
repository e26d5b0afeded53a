//! Normalization helpers for raw inputs: requested platforms, expiry
//! timestamps and expired flags as they appear in source data.

use crate::error::RedeemError;
use crate::types::Platform;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use nonempty::NonEmpty;
use serde_json::Value;
use std::collections::HashSet;
use tracing::debug;

/// Reduce a requested platform filter to known platforms in canonical order.
///
/// An empty filter means every platform. `universal` expands to every
/// platform, `manual` is ignored, and unknown tokens are dropped.
pub fn normalize_requested_platforms<S: AsRef<str>>(
    tokens: &[S],
) -> Result<NonEmpty<Platform>, RedeemError> {
    if tokens.is_empty() {
        return Ok(all_platforms());
    }

    let mut seen: HashSet<Platform> = HashSet::new();
    for token in tokens {
        let token = token.as_ref().trim();
        if token.is_empty() || token.eq_ignore_ascii_case("manual") {
            continue;
        }
        if token.eq_ignore_ascii_case("universal") {
            seen.extend(Platform::ALL);
            continue;
        }
        match Platform::from_token(token) {
            Some(platform) => {
                seen.insert(platform);
            }
            None => debug!("Ignoring unsupported platform token '{}' in filter", token),
        }
    }

    let ordered: Vec<Platform> = Platform::ALL
        .into_iter()
        .filter(|platform| seen.contains(platform))
        .collect();

    NonEmpty::from_vec(ordered).ok_or(RedeemError::NoSupportedPlatforms)
}

/// Every known platform in canonical order.
pub fn all_platforms() -> NonEmpty<Platform> {
    NonEmpty {
        head: Platform::ALL[0],
        tail: Platform::ALL[1..].to_vec(),
    }
}

/// Parse an expiry timestamp as found in the store or the feed.
///
/// Accepts RFC 3339, naive ISO datetimes and a few plain date formats; naive
/// values are taken as UTC. Anything else yields `None`.
pub fn parse_expiry(value: &str) -> Option<DateTime<Utc>> {
    let text = value.trim();
    if text.is_empty() {
        return None;
    }

    if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
        return Some(parsed.with_timezone(&Utc));
    }

    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%d %H:%M",
    ];
    for format in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Some(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Interpret a loosely-typed "expired" marker.
pub fn parse_expired_flag(value: &Value) -> bool {
    match value {
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};
    use serde_json::json;

    #[test]
    fn test_empty_filter_means_all_platforms() {
        let platforms = normalize_requested_platforms::<&str>(&[]).unwrap();
        assert_eq!(platforms.len(), Platform::ALL.len());
        assert_eq!(*platforms.first(), Platform::Epic);
    }

    #[test]
    fn test_filter_is_ordered_and_deduplicated() {
        let platforms = normalize_requested_platforms(&["psn", "Steam", "steam", "bogus"]).unwrap();
        let platforms: Vec<Platform> = platforms.into_iter().collect();
        assert_eq!(platforms, vec![Platform::Steam, Platform::Psn]);
    }

    #[test]
    fn test_universal_expands() {
        let platforms = normalize_requested_platforms(&["universal"]).unwrap();
        assert_eq!(platforms.len(), Platform::ALL.len());
    }

    #[test]
    fn test_only_unknown_tokens_fail() {
        let result = normalize_requested_platforms(&["manual", "dreamcast"]);
        assert_eq!(result.unwrap_err(), RedeemError::NoSupportedPlatforms);
    }

    #[test]
    fn test_parse_expiry_formats() {
        let rfc = parse_expiry("2024-05-01T12:30:00Z").unwrap();
        assert_eq!((rfc.month(), rfc.day(), rfc.hour()), (5, 1, 12));

        let offset = parse_expiry("2024-05-01T12:30:00+02:00").unwrap();
        assert_eq!(offset.hour(), 10);

        let naive = parse_expiry("2024-05-01 08:15").unwrap();
        assert_eq!((naive.hour(), naive.minute()), (8, 15));

        let date = parse_expiry("2024-05-01").unwrap();
        assert_eq!(date.hour(), 0);

        assert!(parse_expiry("soon").is_none());
        assert!(parse_expiry("  ").is_none());
    }

    #[test]
    fn test_parse_expired_flag() {
        assert!(parse_expired_flag(&json!(true)));
        assert!(parse_expired_flag(&json!(1)));
        assert!(parse_expired_flag(&json!("Yes")));
        assert!(!parse_expired_flag(&json!("no")));
        assert!(!parse_expired_flag(&json!(0)));
        assert!(!parse_expired_flag(&Value::Null));
    }
}
