//! Duration parsing for configuration files.
//!
//! Accepts humantime (`250ms`, `10s`, `1m 30s`) and ISO 8601 (`PT10S`).

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parses a duration string, trying humantime before ISO 8601.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s.trim()) {
        return Ok(d);
    }

    if let Ok(d) = iso8601_duration::Duration::parse(s.trim())
        && let Some(std_duration) = d.to_std()
    {
        return Ok(std_duration);
    }

    Err(format!(
        "invalid duration '{s}': expected humantime (10s) or ISO 8601 (PT10S)"
    ))
}

/// Deserializes a duration from a string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Deserializes an optional duration from a string.
pub fn deserialize_option<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    let opt: Option<String> = Option::deserialize(deserializer)?;
    opt.map(|s| parse_duration(&s))
        .transpose()
        .map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_humantime() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("1m 30s").unwrap(), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_iso8601() {
        assert_eq!(parse_duration("PT10S").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("PT1M").unwrap(), Duration::from_secs(60));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_deserialize_option() {
        #[derive(Debug, Deserialize)]
        struct Probe {
            #[serde(default, deserialize_with = "deserialize_option")]
            timeout: Option<Duration>,
        }

        let parsed: Probe = serde_saphyr::from_str("timeout: 200ms\n").unwrap();
        assert_eq!(parsed.timeout, Some(Duration::from_millis(200)));

        let parsed: Probe = serde_saphyr::from_str("{}\n").unwrap();
        assert_eq!(parsed.timeout, None);

        assert!(serde_saphyr::from_str::<Probe>("timeout: later\n").is_err());
    }
}
