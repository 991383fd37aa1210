//! Error policies.
//!
//! A policy decides what happens to a message whose handler failed: retry it
//! by resending through the engine, or give up with `notify_fail`. Retry
//! state lives entirely in the message's `RetryCount` header.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::bus::{BusEngine, Result};
use crate::config::ConfigError;
use crate::host::HandlerError;
use crate::message::Message;

/// Decides the engine call that follows a handler failure.
#[async_trait]
pub trait ErrorPolicy: Send + Sync {
    async fn handle_error(
        &self,
        engine: &dyn BusEngine,
        error: &HandlerError,
        message: Message,
    ) -> Result<()>;
}

// ============================================================================
// No-op
// ============================================================================

/// Gives up immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopErrorPolicy;

#[async_trait]
impl ErrorPolicy for NoopErrorPolicy {
    async fn handle_error(
        &self,
        engine: &dyn BusEngine,
        error: &HandlerError,
        message: Message,
    ) -> Result<()> {
        warn!(
            message_id = %message.message_id,
            descriptor = %message.descriptor(),
            error = %error,
            "Handler failed, no retry policy configured"
        );
        engine.notify_fail(&message).await
    }
}

// ============================================================================
// Retry
// ============================================================================

/// Options for `RetryErrorPolicy`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RetryErrorPolicyOptions {
    /// Resends allowed before giving up. Signed so that a negative value in
    /// configuration is reported instead of failing to parse.
    pub max_retries: i64,
}

/// Resends a failed message with an incremented `RetryCount` until
/// `max_retries` is reached, then calls `notify_fail`.
///
/// A successful resend retires the original delivery with `notify_success`.
#[derive(Debug, Clone)]
pub struct RetryErrorPolicy {
    max_retries: u32,
}

impl RetryErrorPolicy {
    pub fn new(options: RetryErrorPolicyOptions) -> std::result::Result<Self, ConfigError> {
        if options.max_retries < 0 {
            return Err(ConfigError::NegativeMaxRetries(options.max_retries));
        }
        let max_retries = u32::try_from(options.max_retries).map_err(|_| {
            ConfigError::InvalidValue {
                field: "max_retries",
                reason: format!("{} is too large", options.max_retries),
            }
        })?;
        Ok(Self { max_retries })
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }
}

#[async_trait]
impl ErrorPolicy for RetryErrorPolicy {
    async fn handle_error(
        &self,
        engine: &dyn BusEngine,
        error: &HandlerError,
        message: Message,
    ) -> Result<()> {
        let current = message.retry_count();

        if current >= self.max_retries {
            warn!(
                message_id = %message.message_id,
                descriptor = %message.descriptor(),
                retry_count = current,
                max_retries = self.max_retries,
                error = %error,
                "Retries exhausted, failing message"
            );
            return engine.notify_fail(&message).await;
        }

        let mut retry = message.clone();
        retry.headers.set_retry_count(current + 1);

        warn!(
            message_id = %message.message_id,
            descriptor = %message.descriptor(),
            retry_count = current + 1,
            max_retries = self.max_retries,
            error = %error,
            "Handler failed, resending message"
        );

        engine.send(retry).await?;
        engine.notify_success(&message).await
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Error policy selection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum ErrorPolicyConfig {
    #[default]
    Noop,
    Retry(RetryErrorPolicyOptions),
}

impl ErrorPolicyConfig {
    /// Build the configured policy. Invalid options fail here.
    pub fn build(&self) -> std::result::Result<Arc<dyn ErrorPolicy>, ConfigError> {
        match self {
            ErrorPolicyConfig::Noop => Ok(Arc::new(NoopErrorPolicy)),
            ErrorPolicyConfig::Retry(options) => {
                Ok(Arc::new(RetryErrorPolicy::new(options.clone())?))
            }
        }
    }
}
