//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::types::Klass;

/// Configuration validation error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid value for {field}: {message}")]
pub struct ConfigError {
    pub field: String,
    pub message: String,
}

/// Bounded polling with multiplicative backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollPolicy {
    /// Delay before the first recheck, in milliseconds
    pub interval_ms: u64,
    /// Number of rechecks before giving up
    pub max_attempts: u32,
    /// Factor applied to the delay after each attempt (1.0 = fixed interval)
    pub backoff_factor: f64,
    /// Upper bound for the delay, in milliseconds
    pub max_interval_ms: u64,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            max_attempts: 60,
            backoff_factor: 1.0,
            max_interval_ms: 5000,
        }
    }
}

impl PollPolicy {
    /// Delay to wait before `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(64) as i32);
        let millis = (self.interval_ms as f64 * factor).min(self.max_interval_ms.max(self.interval_ms) as f64);
        Duration::from_millis(millis as u64)
    }

    fn validate(&self, field: &str) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError {
                field: format!("{}.max_attempts", field),
                message: "must be greater than 0".to_string(),
            });
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ConfigError {
                field: format!("{}.backoff_factor", field),
                message: "must be a finite number >= 1.0".to_string(),
            });
        }
        Ok(())
    }
}

/// Defaults applied when a request creates a domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateDefaults {
    pub klass: Klass,
    pub label: String,
    /// Template used when the request names none (`None` = system default)
    pub template: Option<String>,
}

impl Default for CreateDefaults {
    fn default() -> Self {
        Self {
            klass: Klass::AppVM,
            label: "red".to_string(),
            template: None,
        }
    }
}

/// Reconciliation engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Polling used by `state: shutdown` with `wait: true`
    pub shutdown_wait: PollPolicy,
    /// Polling used between kill and delete for `state: absent`
    pub removal_wait: PollPolicy,
    /// Where `createinventory` writes its output
    pub inventory_path: PathBuf,
    pub defaults: CreateDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            shutdown_wait: PollPolicy::default(),
            removal_wait: PollPolicy {
                interval_ms: 1000,
                max_attempts: 120,
                backoff_factor: 1.5,
                max_interval_ms: 5000,
            },
            inventory_path: PathBuf::from("inventory"),
            defaults: CreateDefaults::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shutdown_wait.validate("shutdown_wait")?;
        self.removal_wait.validate("removal_wait")?;
        if self.inventory_path.as_os_str().is_empty() {
            return Err(ConfigError {
                field: "inventory_path".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_yaml_overrides_merge_with_defaults() {
        let yaml = r#"
removal_wait:
  interval_ms: 200
  max_attempts: 10
inventory_path: /tmp/qubes-inventory
defaults:
  label: blue
"#;
        let config: EngineConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.removal_wait.interval_ms, 200);
        assert_eq!(config.removal_wait.max_attempts, 10);
        assert_eq!(config.removal_wait.backoff_factor, 1.0);
        assert_eq!(config.shutdown_wait, PollPolicy::default());
        assert_eq!(config.defaults.label, "blue");
        assert_eq!(config.defaults.klass, Klass::AppVM);
    }

    #[test]
    fn test_backoff_is_capped() {
        let policy = PollPolicy {
            interval_ms: 100,
            max_attempts: 10,
            backoff_factor: 2.0,
            max_interval_ms: 500,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(3), Duration::from_millis(500));
        assert_eq!(policy.delay(40), Duration::from_millis(500));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = EngineConfig::default();
        config.removal_wait.max_attempts = 0;
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "removal_wait.max_attempts");
    }
}
