//! Engine configuration types.

use serde::Deserialize;

use crate::bus::rabbitmq::ExchangeOptions;
use crate::serialization::DEFAULT_ENCODING;

/// Engine type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub enum EngineType {
    /// Single-process engine, no broker.
    #[default]
    #[serde(rename = "in_memory", alias = "inmemory", alias = "memory")]
    InMemory,
    /// RabbitMQ broker engine.
    #[serde(rename = "rabbitmq", alias = "amqp")]
    RabbitMq,
}

/// Engine configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine type discriminator.
    #[serde(rename = "type")]
    pub engine_type: EngineType,
    /// RabbitMQ-specific configuration.
    pub rabbitmq: RabbitMqConfig,
}

/// Queue naming strategy for one message class.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "provider", rename_all = "lowercase")]
pub enum QueueConfig {
    /// Durable named queue that survives restarts and is shared between
    /// instances of the same service.
    Static { queue_name: String },
    /// Server-named, exclusive, auto-delete queue.
    #[default]
    Temporary,
}

/// RabbitMQ-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RabbitMqConfig {
    /// AMQP connection URL.
    pub url: String,
    /// Text encoding label used for outbound payloads.
    pub outbound_encoding: String,
    /// Queue for subscribed commands.
    pub command_queue: QueueConfig,
    /// Queue for subscribed events.
    pub event_queue: QueueConfig,
    /// Options for command exchanges.
    pub command_exchange: ExchangeOptions,
    /// Options for event exchanges.
    pub event_exchange: ExchangeOptions,
    /// Maximum unacknowledged deliveries (global QoS). Unset means broker default.
    pub unacked_message_count_limit: Option<u16>,
    /// Exchange that receives rejected deliveries. Unset means nacks requeue.
    pub dead_letter_exchange: Option<String>,
    /// Attempts made to open the initial connection.
    pub connection_retries: usize,
}

impl Default for RabbitMqConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            outbound_encoding: DEFAULT_ENCODING.to_string(),
            command_queue: QueueConfig::default(),
            event_queue: QueueConfig::default(),
            command_exchange: ExchangeOptions::default(),
            event_exchange: ExchangeOptions::default(),
            unacked_message_count_limit: None,
            dead_letter_exchange: None,
            connection_retries: 5,
        }
    }
}
