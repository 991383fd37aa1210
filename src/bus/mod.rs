//! Bus engines.
//!
//! This module contains:
//! - `BusEngine` trait: the transport contract the host drives
//! - `BusEngineExt`: typed subscription helpers
//! - `BusError` and the engine lifecycle
//! - Implementations: RabbitMQ, in-memory, mock
//! - `init_bus_engine` factory

use std::sync::Arc;

use async_trait::async_trait;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::config::{ConfigError, EngineConfig, EngineType};
use crate::message::{Command, Event, Message, MessageRegistration, MessageType};
use crate::serialization::SerializationError;

// Implementation modules
pub mod in_memory;
pub mod mock;
pub mod rabbitmq;

// Re-exports
pub use in_memory::InMemoryBusEngine;
pub use mock::{MockBroker, MockBusEngine};
pub use rabbitmq::{RabbitMqBusEngine, RabbitMqOptions};

// ============================================================================
// Traits
// ============================================================================

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Live sequence of inbound messages produced by `BusEngine::start`.
///
/// Ends only when the engine stops or its transport is lost; it cannot be
/// restarted.
pub type MessageStream = ReceiverStream<Message>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Engine already started")]
    AlreadyStarted,

    #[error("Engine not started")]
    NotStarted,

    #[error("Engine stopped")]
    Stopped,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<serde_json::Error> for BusError {
    fn from(err: serde_json::Error) -> Self {
        BusError::Serialization(SerializationError::Json(err))
    }
}

/// Transport contract between the host and a message broker.
///
/// Lifecycle: `Created → Started → Stopped`. `Stopped` is terminal; a fresh
/// engine is required to consume again.
///
/// Implementations:
/// - `RabbitMqBusEngine`: RabbitMQ via AMQP
/// - `InMemoryBusEngine`: single process, no network
/// - `MockBusEngine`: records calls for testing
#[async_trait]
pub trait BusEngine: Send + Sync {
    /// Register a message type. Valid only before `start`.
    ///
    /// Returns `false` if the type was already registered.
    async fn subscribe(&self, registration: MessageRegistration) -> Result<bool>;

    /// Declare topology and begin consuming.
    ///
    /// With no subscriptions the returned stream never yields and ends only
    /// when the engine stops.
    async fn start(&self) -> Result<MessageStream>;

    /// Tear down consumers and release the transport. Not a drain.
    async fn stop(&self) -> Result<()>;

    /// Publish a command. Does not require the type to be subscribed.
    async fn send_command(&self, message: Message) -> Result<()>;

    /// Publish an event. Does not require the type to be subscribed.
    async fn send_event(&self, message: Message) -> Result<()>;

    /// Publish a message through the send path of its class.
    async fn send(&self, message: Message) -> Result<()> {
        match message.message_type() {
            MessageType::Command => self.send_command(message).await,
            MessageType::Event => self.send_event(message).await,
        }
    }

    /// Acknowledge the delivery the message came from.
    async fn notify_success(&self, message: &Message) -> Result<()>;

    /// Negatively acknowledge the delivery the message came from.
    async fn notify_fail(&self, message: &Message) -> Result<()>;
}

/// Typed subscription helpers for any engine.
#[async_trait]
pub trait BusEngineExt: BusEngine {
    async fn subscribe_to_command<T: Command>(&self) -> Result<bool> {
        self.subscribe(MessageRegistration::command::<T>()).await
    }

    async fn subscribe_to_event<T: Event>(&self) -> Result<bool> {
        self.subscribe(MessageRegistration::event::<T>()).await
    }
}

impl<E: BusEngine + ?Sized> BusEngineExt for E {}

// ============================================================================
// Lifecycle
// ============================================================================

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EngineState {
    #[default]
    Created,
    Started,
    Stopped,
}

impl EngineState {
    /// Subscriptions and `start` are only valid while `Created`.
    pub fn ensure_created(self) -> Result<()> {
        match self {
            EngineState::Created => Ok(()),
            EngineState::Started => Err(BusError::AlreadyStarted),
            EngineState::Stopped => Err(BusError::Stopped),
        }
    }

    /// Transport operations are only valid while `Started`.
    pub fn ensure_started(self) -> Result<()> {
        match self {
            EngineState::Started => Ok(()),
            EngineState::Created => Err(BusError::NotStarted),
            EngineState::Stopped => Err(BusError::Stopped),
        }
    }
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a bus engine based on configuration.
///
/// Requires the corresponding feature for broker engines:
/// - RabbitMQ: `--features amqp` (included in default)
pub fn init_bus_engine(config: &EngineConfig) -> Result<Arc<dyn BusEngine>> {
    match config.engine_type {
        EngineType::InMemory => {
            info!(engine_type = "in_memory", "Bus engine initialized");
            Ok(Arc::new(InMemoryBusEngine::new()))
        }
        EngineType::RabbitMq => {
            #[cfg(feature = "amqp")]
            {
                let options = RabbitMqOptions::from_config(&config.rabbitmq)?;
                let factory = rabbitmq::LapinConnectionFactory::new(&config.rabbitmq.url)
                    .with_max_attempts(config.rabbitmq.connection_retries);
                let engine = RabbitMqBusEngine::new(options, Arc::new(factory));
                info!(
                    engine_type = "rabbitmq",
                    url = %config.rabbitmq.url,
                    "Bus engine initialized"
                );
                Ok(Arc::new(engine))
            }

            #[cfg(not(feature = "amqp"))]
            {
                Err(ConfigError::FeatureDisabled("rabbitmq", "amqp").into())
            }
        }
    }
}

#[cfg(test)]
mod tests;
