//! Bootstrap utilities for processes embedding a bus host.

use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bus::{init_bus_engine, Result};
use crate::config::{Config, LOG_ENV_VAR};
use crate::host::BusHost;

/// Initialize tracing with the SWITCHYARD_LOG environment variable.
///
/// Defaults to "info" level if SWITCHYARD_LOG is not set. Calling it again
/// after a subscriber is installed does nothing.
pub fn init_tracing() {
    let installed = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_env(LOG_ENV_VAR)
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .try_init();

    if installed.is_err() {
        debug!("Tracing subscriber already installed");
    }
}

/// Build the configured engine and a host driving it.
///
/// Nothing connects until the host is started.
pub fn host_from_config(config: &Config) -> Result<BusHost> {
    let engine = init_bus_engine(&config.engine)?;
    Ok(BusHost::from_config(engine, &config.host)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusError;
    use crate::config::ConfigError;
    use crate::policy::{ErrorPolicyConfig, RetryErrorPolicyOptions};

    #[test]
    fn test_init_tracing_is_idempotent() {
        init_tracing();
        init_tracing();
    }

    #[test]
    fn test_host_from_default_config() {
        assert!(host_from_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_host_from_config_rejects_invalid_policy() {
        let mut config = Config::default();
        config.host.error_policy =
            ErrorPolicyConfig::Retry(RetryErrorPolicyOptions { max_retries: -2 });

        assert!(matches!(
            host_from_config(&config),
            Err(BusError::Config(ConfigError::NegativeMaxRetries(-2)))
        ));
    }
}
