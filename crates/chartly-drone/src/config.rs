// SPDX-License-Identifier: MIT OR Apache-2.0

//! Environment-driven drone configuration.

use std::time::Duration;
use uuid::Uuid;

use crate::{DEFAULT_USER_AGENT, DroneError};

/// Runtime settings for one drone process.
///
/// The environment is the configuration surface:
///
/// | Variable | Meaning | Default |
/// |---|---|---|
/// | `CONTROL_PLANE` | Control-plane base URL | required |
/// | `DRONE_ID` | Stable drone identity | fresh UUIDv4 |
/// | `PROCESS_INTERVAL` | Iteration cadence | `5m` |
/// | `CHARTLY_USER_AGENT` | Outbound User-Agent | `Chartly-Drone/1.0` |
/// | `CHARTLY_REGISTRY_API_KEY` | `X-API-Key` for registry writes | none |
#[derive(Debug, Clone)]
pub struct DroneConfig {
    /// Control-plane base URL (no trailing slash).
    pub control_plane: String,
    /// This drone's identity.
    pub drone_id: String,
    /// Pause between iterations.
    pub process_interval: Duration,
    /// Outbound User-Agent.
    pub user_agent: String,
    /// API key attached to registry write requests.
    pub registry_api_key: Option<String>,
}

impl DroneConfig {
    /// Build the configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`DroneError::MissingEnv`] when `CONTROL_PLANE` is unset, or
    /// [`DroneError::InvalidEnv`] for an unparseable `PROCESS_INTERVAL`.
    pub fn from_env() -> Result<Self, DroneError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the configuration from an explicit lookup, for tests.
    ///
    /// # Errors
    ///
    /// Same failure modes as [`DroneConfig::from_env`].
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, DroneError> {
        let control_plane = lookup("CONTROL_PLANE")
            .filter(|v| !v.trim().is_empty())
            .ok_or(DroneError::MissingEnv {
                name: "CONTROL_PLANE",
            })?;
        let control_plane = control_plane.trim_end_matches('/').to_string();

        let drone_id = lookup("DRONE_ID")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let process_interval = match lookup("PROCESS_INTERVAL") {
            Some(raw) => parse_duration(&raw).ok_or(DroneError::InvalidEnv {
                name: "PROCESS_INTERVAL",
                value: raw,
            })?,
            None => Duration::from_secs(300),
        };

        let user_agent = lookup("CHARTLY_USER_AGENT")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());

        Ok(Self {
            control_plane,
            drone_id,
            process_interval,
            user_agent,
            registry_api_key: lookup("CHARTLY_REGISTRY_API_KEY"),
        })
    }
}

/// Parse a compact duration string: `500ms`, `30s`, `5m`, `2h`, `1d`.
///
/// A bare number is taken as seconds.
#[must_use]
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(amount)),
        "s" | "" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_secs(amount * 60)),
        "h" => Some(Duration::from_secs(amount * 3_600)),
        "d" => Some(Duration::from_secs(amount * 86_400)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env<'a>(pairs: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| {
            pairs
                .iter()
                .find(|(k, _)| *k == name)
                .map(|(_, v)| (*v).to_string())
        }
    }

    #[test]
    fn control_plane_is_required() {
        let err = DroneConfig::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, DroneError::MissingEnv { name: "CONTROL_PLANE" }));
    }

    #[test]
    fn defaults_apply() {
        let config =
            DroneConfig::from_lookup(env(&[("CONTROL_PLANE", "https://cp.example.com/")])).unwrap();
        assert_eq!(config.control_plane, "https://cp.example.com");
        assert_eq!(config.process_interval, Duration::from_secs(300));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert!(config.registry_api_key.is_none());
        // Default drone id is a UUID.
        assert!(uuid::Uuid::parse_str(&config.drone_id).is_ok());
    }

    #[test]
    fn explicit_values_override_defaults() {
        let config = DroneConfig::from_lookup(env(&[
            ("CONTROL_PLANE", "https://cp.example.com"),
            ("DRONE_ID", "drone-7"),
            ("PROCESS_INTERVAL", "30s"),
            ("CHARTLY_USER_AGENT", "Custom/2.0"),
            ("CHARTLY_REGISTRY_API_KEY", "secret"),
        ]))
        .unwrap();
        assert_eq!(config.drone_id, "drone-7");
        assert_eq!(config.process_interval, Duration::from_secs(30));
        assert_eq!(config.user_agent, "Custom/2.0");
        assert_eq!(config.registry_api_key.as_deref(), Some("secret"));
    }

    #[test]
    fn invalid_interval_is_rejected() {
        let err = DroneConfig::from_lookup(env(&[
            ("CONTROL_PLANE", "https://cp.example.com"),
            ("PROCESS_INTERVAL", "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, DroneError::InvalidEnv { name: "PROCESS_INTERVAL", .. }));
    }

    #[test]
    fn duration_parsing() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("30s"), Some(Duration::from_secs(30)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("1d"), Some(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("90"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration(" 10s "), Some(Duration::from_secs(10)));
        assert_eq!(parse_duration("x"), None);
        assert_eq!(parse_duration("10w"), None);
        assert_eq!(parse_duration(""), None);
    }
}
