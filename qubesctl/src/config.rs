//! Configuration management for the qubesctl front end.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use qubesctl_common::LogFormat;
use qubesctl_core::EngineConfig;

use crate::cli::Args;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/qubesctl/config.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log format (pretty, json)
    pub log_format: String,
    /// Reconciliation engine settings
    pub engine: EngineConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "warn".to_string(),
            log_format: "pretty".to_string(),
            engine: EngineConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| "Failed to parse config file")?;

        config.engine.validate()?;
        Ok(config)
    }

    /// Load the file named on the command line, else the default location if
    /// it exists, else defaults.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => Self::load(path)?,
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH)?,
            None => Self::default(),
        };
        Ok(config.with_cli_overrides(args))
    }

    /// Apply CLI overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref level) = args.log_level {
            self.log_level = level.clone();
        }

        if args.json_logs {
            self.log_format = "json".to_string();
        }

        if let Some(ref inventory) = args.inventory {
            self.engine.inventory_path = inventory.clone();
        }

        self
    }

    pub fn log_format(&self) -> Result<LogFormat> {
        self.log_format.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn test_load_merges_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "log_level: debug\nengine:\n  shutdown_wait:\n    max_attempts: 5\n"
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.log_format().unwrap(), LogFormat::Pretty);
        assert_eq!(config.engine.shutdown_wait.max_attempts, 5);
        assert_eq!(config.engine.removal_wait, EngineConfig::default().removal_wait);
    }

    #[test]
    fn test_invalid_engine_config_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "engine:\n  removal_wait:\n    max_attempts: 0\n").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let args = Args::parse_from([
            "qubesctl",
            "--log-level",
            "trace",
            "--json-logs",
            "--inventory",
            "/tmp/inv",
            "request.yaml",
        ]);
        let config = Config::default().with_cli_overrides(&args);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.log_format().unwrap(), LogFormat::Json);
        assert_eq!(config.engine.inventory_path, Path::new("/tmp/inv"));
    }
}
