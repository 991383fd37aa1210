//! Application configuration.
//!
//! Aggregates engine and host configuration into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod engine;

pub use engine::{EngineConfig, EngineType, QueueConfig, RabbitMqConfig};

use serde::Deserialize;

use crate::policy::ErrorPolicyConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "switchyard.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SWITCHYARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SWITCHYARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SWITCHYARD_LOG";

/// Configuration errors. Raised at construction time, never recovered.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid text encoding '{0}'")]
    InvalidEncoding(String),

    #[error("max_retries must not be negative (got {0})")]
    NegativeMaxRetries(i64),

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Engine '{0}' requires the '{1}' feature")]
    FeatureDisabled(&'static str, &'static str),
}

/// Host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Error policy applied to failed handlers.
    pub error_policy: ErrorPolicyConfig,
    /// Maximum messages dispatched concurrently. Unset means unbounded.
    pub concurrency_limit: Option<usize>,
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Engine configuration.
    pub engine: EngineConfig,
    /// Host configuration.
    pub host: HostConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `switchyard.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, File, FileFormat};

        let config = ConfigLib::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}
