//! Duration parsing shared by the config layer and the CLI.

use crate::error::{ConfigError, ConfigResult};
use std::time::Duration;

/// Parse a k6-style duration such as `"30s"`, `"500ms"`, `"1.5m"` or `"2h"`.
///
/// A bare number is read as milliseconds. Negative and non-finite values are
/// rejected. Returns `None` when the string cannot be parsed.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    let (number, scale) = if let Some(n) = s.strip_suffix("ms") {
        (n, 0.001)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('m') {
        (n, 60.0)
    } else if let Some(n) = s.strip_suffix('h') {
        (n, 3600.0)
    } else {
        (s, 0.001)
    };
    let value: f64 = number.trim().parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some(Duration::from_secs_f64(value * scale))
}

/// Like [`parse_duration_str`], but names the offending config field.
pub fn parse_config_duration(field: &str, value: &str) -> ConfigResult<Duration> {
    parse_duration_str(value).ok_or_else(|| ConfigError::InvalidDuration {
        field: field.to_string(),
        value: value.to_string(),
    })
}

/// Parse an optional duration field, falling back to `default` when absent.
pub fn optional_duration(
    field: &str,
    value: Option<&str>,
    default: Duration,
) -> ConfigResult<Duration> {
    match value {
        Some(v) => parse_config_duration(field, v),
        None => Ok(default),
    }
}

/// Milliseconds as `f64`, the unit every latency in the crate is reported in.
pub fn as_millis_f64(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration_str("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration_str("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration_str("1h"), Some(Duration::from_secs(3600)));
        assert_eq!(parse_duration_str("250"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_parse_fractional_and_whitespace() {
        assert_eq!(parse_duration_str(" 1.5s "), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration_str("0.5m"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration_str("0s"), Some(Duration::ZERO));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert_eq!(parse_duration_str(""), None);
        assert_eq!(parse_duration_str("abc"), None);
        assert_eq!(parse_duration_str("-1s"), None);
        assert_eq!(parse_duration_str("s"), None);
    }

    #[test]
    fn test_config_duration_error_names_field() {
        let err = parse_config_duration("graceful_stop", "soon").unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidDuration {
                field: "graceful_stop".to_string(),
                value: "soon".to_string()
            }
        );
        assert_eq!(
            optional_duration("pause", None, Duration::from_secs(1)).unwrap(),
            Duration::from_secs(1)
        );
    }

    #[test]
    fn test_as_millis_f64() {
        assert_eq!(as_millis_f64(Duration::from_micros(1500)), 1.5);
    }
}
