//! Daemon configuration loading.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Json, Serialized};
use figment::Figment;
use std::path::Path;
use thiserror::Error;

use crate::domain::models::AgentConfig;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid max_executors: {0}. Must be between 1 and 64")]
    InvalidMaxExecutors(usize),

    #[error("Invalid routine interval: {0}s. Must be at least 1")]
    InvalidRoutineInterval(u64),

    #[error("Invalid queue fetch timeout: {0}ms. Must be positive")]
    InvalidFetchTimeout(u64),

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid registration retry: retry {0}s exceeds max retry {1}s")]
    InvalidRegistrationRetry(u64, u64),

    #[error("Base directory cannot be empty")]
    EmptyBaseDir,
}

/// Configuration loader with hierarchical merging.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `config.json` under the base directory (when present)
    /// 3. Environment variables (`ACME_` prefix, highest priority)
    pub fn load() -> Result<AgentConfig> {
        let defaults = AgentConfig::default();
        let config_file = defaults.base_dir.join("config.json");

        let config: AgentConfig = Figment::new()
            .merge(Serialized::defaults(defaults))
            .merge(Json::file(config_file))
            .merge(Env::prefixed("ACME_").split("__"))
            .extract()
            .context("Failed to extract agent configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<AgentConfig> {
        let config: AgentConfig = Figment::new()
            .merge(Serialized::defaults(AgentConfig::default()))
            .merge(Json::file(path.as_ref()))
            .merge(Env::prefixed("ACME_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate configuration after loading.
    pub fn validate(config: &AgentConfig) -> Result<(), ConfigError> {
        if config.base_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyBaseDir);
        }

        if config.compliance.max_executors == 0 || config.compliance.max_executors > 64 {
            return Err(ConfigError::InvalidMaxExecutors(
                config.compliance.max_executors,
            ));
        }
        if config.compliance.routine_interval_secs == 0 {
            return Err(ConfigError::InvalidRoutineInterval(
                config.compliance.routine_interval_secs,
            ));
        }
        if config.compliance.queue_fetch_timeout_ms == 0 {
            return Err(ConfigError::InvalidFetchTimeout(
                config.compliance.queue_fetch_timeout_ms,
            ));
        }

        if config.registration.retry_frequency_secs > config.registration.max_retry_frequency_secs
        {
            return Err(ConfigError::InvalidRegistrationRetry(
                config.registration.retry_frequency_secs,
                config.registration.max_retry_frequency_secs,
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        Ok(())
    }
}
