//! Broker transport seam.
//!
//! The engine talks to the broker through `BrokerChannel`, a narrow view of an
//! AMQP channel. The production implementation wraps `lapin`; tests use
//! `MockBroker`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Deserialize;

use crate::bus::Result;

/// Exchange declaration options for one message class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExchangeOptions {
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Exchange that receives deliveries rejected without requeue.
    pub dead_letter_exchange: Option<String>,
}

/// Header value as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireValue {
    Bytes(Vec<u8>),
    Integer(i64),
    Boolean(bool),
}

impl WireValue {
    /// Textual form of the value. Byte strings are read as UTF-8.
    pub fn to_text(&self) -> String {
        match self {
            WireValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            WireValue::Integer(value) => value.to_string(),
            WireValue::Boolean(value) => value.to_string(),
        }
    }
}

impl From<&str> for WireValue {
    fn from(value: &str) -> Self {
        WireValue::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for WireValue {
    fn from(value: String) -> Self {
        WireValue::Bytes(value.into_bytes())
    }
}

/// One inbound delivery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub content_encoding: Option<String>,
    pub message_id: Option<String>,
    pub headers: BTreeMap<String, WireValue>,
    pub body: Vec<u8>,
}

impl Delivery {
    pub fn new(delivery_tag: u64, body: impl Into<Vec<u8>>) -> Self {
        Self {
            delivery_tag,
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<WireValue>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }

    pub fn with_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }
}

/// One outbound publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub body: Vec<u8>,
    pub content_encoding: String,
    pub message_id: String,
    pub headers: BTreeMap<String, WireValue>,
    /// Persistent delivery mode.
    pub persistent: bool,
}

/// Stream of deliveries from one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A single AMQP channel.
///
/// Callers serialize access: the engine holds it behind one async mutex.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a fanout exchange.
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()>;

    /// Declare a queue. An empty name asks the broker to generate one; the
    /// actual name is returned.
    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Basic QoS prefetch count.
    async fn set_prefetch(&self, count: u16, global: bool) -> Result<()>;

    async fn consume(&self, queue: &str) -> Result<DeliveryStream>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    /// Close the channel and its connection.
    async fn close(&self) -> Result<()>;
}

/// Opens broker channels.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>>;
}

/// Declares the queue a message class is consumed from.
#[async_trait]
pub trait QueueFactory: Send + Sync {
    /// Declare the queue and return its actual name.
    async fn create_queue(
        &self,
        channel: &dyn BrokerChannel,
        dead_letter_exchange: Option<&str>,
    ) -> Result<String>;
}

/// Durable named queue, shared by every instance consuming it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticQueueFactory {
    queue_name: String,
}

impl StaticQueueFactory {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl QueueFactory for StaticQueueFactory {
    async fn create_queue(
        &self,
        channel: &dyn BrokerChannel,
        dead_letter_exchange: Option<&str>,
    ) -> Result<String> {
        let options = QueueOptions {
            durable: true,
            exclusive: false,
            auto_delete: false,
            dead_letter_exchange: dead_letter_exchange.map(str::to_string),
        };
        channel.declare_queue(&self.queue_name, &options).await
    }
}

/// Server-named queue owned by this connection, deleted when it closes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TemporaryQueueFactory;

#[async_trait]
impl QueueFactory for TemporaryQueueFactory {
    async fn create_queue(
        &self,
        channel: &dyn BrokerChannel,
        dead_letter_exchange: Option<&str>,
    ) -> Result<String> {
        let options = QueueOptions {
            durable: true,
            exclusive: true,
            auto_delete: true,
            dead_letter_exchange: dead_letter_exchange.map(str::to_string),
        };
        channel.declare_queue("", &options).await
    }
}
