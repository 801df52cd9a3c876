use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Policy parameters for a family of fork contexts. Immutable once loaded.
///
/// Field names map 1:1 onto the recognized configuration keys
/// (`delivery-timeout`, `fork-late`, ...) through the kebab-case renaming,
/// so a config file section deserializes directly into this struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ForkConfig {
    /// Upper bound in seconds for late forking; arms the late timer.
    pub delivery_timeout: u64,
    /// Seconds to buffer urgent or retryable replies before forwarding.
    pub urgent_timeout: u64,
    /// Seconds to wait for a response after a push notification was triggered.
    pub push_response_timeout: u64,
    /// Create new branches for registrations arriving after the initial fork.
    pub fork_late: bool,
    /// Forward at most one provisional/final pair upstream.
    pub fork_one_response: bool,
    /// Do not let a 6xx from one branch terminate the whole fork.
    pub fork_no_global_decline: bool,
    /// Treat 603 Decline as urgent; only meaningful with
    /// `fork_no_global_decline`.
    pub treat_decline_as_urgent: bool,
    /// Strip the To-tag from forwarded responses (buggy-upstream workaround).
    pub remove_to_tag: bool,
}

impl Default for ForkConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: 30,
            urgent_timeout: 5,
            push_response_timeout: 10,
            fork_late: false,
            fork_one_response: false,
            fork_no_global_decline: false,
            treat_decline_as_urgent: false,
            remove_to_tag: false,
        }
    }
}

/// Errors from the line-oriented option loader.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("unrecognized fork option `{0}`")]
    UnknownKey(String),
    #[error("invalid value `{value}` for fork option `{key}`")]
    InvalidValue { key: String, value: String },
}

impl ForkConfig {
    /// Applies a single `key value` pair from a line-oriented config source.
    pub fn apply(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "delivery-timeout" => self.delivery_timeout = parse_secs(key, value)?,
            "urgent-timeout" => self.urgent_timeout = parse_secs(key, value)?,
            "push-response-timeout" => self.push_response_timeout = parse_secs(key, value)?,
            "fork-late" => self.fork_late = parse_bool(key, value)?,
            "fork-one-response" => self.fork_one_response = parse_bool(key, value)?,
            "fork-no-global-decline" => self.fork_no_global_decline = parse_bool(key, value)?,
            "treat-decline-as-urgent" => self.treat_decline_as_urgent = parse_bool(key, value)?,
            "remove-to-tag" => self.remove_to_tag = parse_bool(key, value)?,
            other => return Err(ConfigError::UnknownKey(other.to_owned())),
        }
        Ok(())
    }

    /// Late-forking window as a duration.
    pub fn delivery_window(&self) -> Duration {
        Duration::from_secs(self.delivery_timeout)
    }

    /// Urgent-response buffering window as a duration.
    pub fn urgent_window(&self) -> Duration {
        Duration::from_secs(self.urgent_timeout)
    }

    /// Push-response window as a duration.
    pub fn push_window(&self) -> Duration {
        Duration::from_secs(self.push_response_timeout)
    }
}

fn parse_secs(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_owned(),
        value: value.to_owned(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_owned(),
            value: value.to_owned(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_conservative() {
        let cfg = ForkConfig::default();
        assert_eq!(cfg.delivery_timeout, 30);
        assert_eq!(cfg.urgent_timeout, 5);
        assert!(!cfg.fork_late);
        assert!(!cfg.fork_one_response);
        assert!(!cfg.remove_to_tag);
    }

    #[test]
    fn applies_recognized_keys() {
        let mut cfg = ForkConfig::default();
        cfg.apply("fork-late", "true").unwrap();
        cfg.apply("delivery-timeout", "120").unwrap();
        cfg.apply("treat-decline-as-urgent", "1").unwrap();

        assert!(cfg.fork_late);
        assert_eq!(cfg.delivery_window(), Duration::from_secs(120));
        assert!(cfg.treat_decline_as_urgent);
    }

    #[test]
    fn rejects_unknown_keys_and_bad_values() {
        let mut cfg = ForkConfig::default();
        assert_eq!(
            cfg.apply("fork-early", "true"),
            Err(ConfigError::UnknownKey("fork-early".to_owned()))
        );
        assert!(matches!(
            cfg.apply("delivery-timeout", "soon"),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn deserializes_from_kebab_case_json() {
        let cfg: ForkConfig = serde_json::from_str(
            r#"{"fork-late": true, "delivery-timeout": 45, "remove-to-tag": true}"#,
        )
        .unwrap();
        assert!(cfg.fork_late);
        assert_eq!(cfg.delivery_timeout, 45);
        assert!(cfg.remove_to_tag);
        assert_eq!(cfg.urgent_timeout, 5);
    }

    #[test]
    fn serializes_back_to_kebab_case() {
        let cfg = ForkConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        assert!(json.contains("\"fork-no-global-decline\""));
        assert!(json.contains("\"push-response-timeout\""));
    }
}
