//! `lapin`-backed broker channel.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use ::lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use async_trait::async_trait;
use backon::{BackoffBuilder, ExponentialBuilder};
use futures::StreamExt;
use tracing::{error, info, warn};

use super::transport::{
    BrokerChannel, ConnectionFactory, Delivery, DeliveryStream, ExchangeOptions, OutboundMessage,
    QueueOptions, WireValue,
};
use crate::bus::{BusError, Result};

/// Consumer tag prefix; the queue name is appended.
const CONSUMER_TAG_PREFIX: &str = "switchyard";

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Reply code sent when closing channel and connection.
const REPLY_SUCCESS: u16 = 200;

/// Opens a connection and one channel on it.
///
/// The initial connection is retried with exponential backoff and jitter.
#[derive(Debug, Clone)]
pub struct LapinConnectionFactory {
    url: String,
    max_attempts: usize,
}

impl LapinConnectionFactory {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_attempts: 5,
        }
    }

    /// Attempts made before giving up. At least one attempt is always made.
    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    async fn open(&self) -> Result<LapinChannel> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        Ok(LapinChannel {
            connection,
            channel,
        })
    }
}

#[async_trait]
impl ConnectionFactory for LapinConnectionFactory {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(5))
            .with_max_times(self.max_attempts.saturating_sub(1))
            .with_jitter()
            .build();

        let mut last_error = None;

        for (attempt, delay) in std::iter::once(Duration::ZERO).chain(backoff).enumerate() {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            match self.open().await {
                Ok(channel) => {
                    info!(url = %self.url, attempt = attempt + 1, "Connected to RabbitMQ");
                    return Ok(Box::new(channel));
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Failed to connect to RabbitMQ, retrying..."
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| BusError::Connection("No connection attempt made".to_string())))
    }
}

/// Channel plus the connection that owns it.
struct LapinChannel {
    connection: Connection,
    channel: Channel,
}

fn to_field_table(headers: BTreeMap<String, WireValue>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        let value = match value {
            WireValue::Bytes(bytes) => AMQPValue::LongString(LongString::from(bytes)),
            WireValue::Integer(number) => AMQPValue::LongLongInt(number),
            WireValue::Boolean(flag) => AMQPValue::Boolean(flag),
        };
        table.insert(ShortString::from(key), value);
    }
    table
}

/// Map an AMQP header value. Nested tables, arrays and decimals are dropped.
fn from_amqp_value(value: &AMQPValue) -> Option<WireValue> {
    match value {
        AMQPValue::LongString(text) => Some(WireValue::Bytes(text.as_bytes().to_vec())),
        AMQPValue::ShortString(text) => Some(WireValue::from(text.as_str())),
        AMQPValue::ByteArray(bytes) => Some(WireValue::Bytes(bytes.as_slice().to_vec())),
        AMQPValue::Boolean(flag) => Some(WireValue::Boolean(*flag)),
        AMQPValue::ShortShortInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::ShortShortUInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::ShortInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::ShortUInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::LongInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::LongUInt(n) => Some(WireValue::Integer(i64::from(*n))),
        AMQPValue::LongLongInt(n) => Some(WireValue::Integer(*n)),
        AMQPValue::Timestamp(n) => i64::try_from(*n).ok().map(WireValue::Integer),
        _ => None,
    }
}

fn from_lapin_delivery(delivery: ::lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;

    let headers: BTreeMap<String, WireValue> = properties
        .headers()
        .as_ref()
        .map(|table| {
            table
                .inner()
                .iter()
                .filter_map(|(key, value)| {
                    from_amqp_value(value).map(|value| (key.as_str().to_string(), value))
                })
                .collect()
        })
        .unwrap_or_default();

    Delivery {
        delivery_tag: delivery.delivery_tag,
        content_encoding: properties
            .content_encoding()
            .as_ref()
            .map(|encoding| encoding.as_str().to_string()),
        message_id: properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string()),
        headers,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        self.channel
            .exchange_declare(
                name,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: options.durable,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare exchange '{}': {}", name, e)))
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        let mut arguments = FieldTable::default();
        if let Some(exchange) = &options.dead_letter_exchange {
            arguments.insert(
                ShortString::from("x-dead-letter-exchange"),
                AMQPValue::LongString(LongString::from(exchange.as_str())),
            );
        }

        let queue = self
            .channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to declare queue '{}': {}", name, e)))?;

        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Topology(format!("Failed to bind queue: {}", e)))
    }

    async fn set_prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.channel
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|e| BusError::Topology(format!("Failed to set QoS: {}", e)))
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        let consumer_tag = format!("{}-{}", CONSUMER_TAG_PREFIX, queue);
        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        Ok(consumer
            .map(|delivery| {
                delivery
                    .map(from_lapin_delivery)
                    .map_err(|e| BusError::Subscribe(format!("Delivery failed: {}", e)))
            })
            .boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        let mut properties = BasicProperties::default()
            .with_content_encoding(ShortString::from(message.content_encoding))
            .with_message_id(ShortString::from(message.message_id))
            .with_headers(to_field_table(message.headers));
        if message.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }

        self.channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?
            .await
            .map_err(|e| BusError::Publish(format!("Publish not confirmed: {}", e)))?;

        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to ack: {}", e)))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| BusError::Acknowledge(format!("Failed to nack: {}", e)))
    }

    async fn close(&self) -> Result<()> {
        close_in_order(
            async {
                self.channel
                    .close(REPLY_SUCCESS, "engine stopped")
                    .await
                    .map_err(|e| BusError::Connection(format!("Failed to close channel: {}", e)))
            },
            async {
                self.connection
                    .close(REPLY_SUCCESS, "engine stopped")
                    .await
                    .map_err(|e| {
                        BusError::Connection(format!("Failed to close connection: {}", e))
                    })
            },
        )
        .await
    }
}

/// Close the channel, then the connection, whatever the channel reported.
/// The first error is returned.
async fn close_in_order<C, K>(channel: C, connection: K) -> Result<()>
where
    C: Future<Output = Result<()>>,
    K: Future<Output = Result<()>>,
{
    let channel_result = channel.await;
    if let Err(e) = &channel_result {
        warn!(error = %e, "Channel close failed, closing connection anyway");
    }
    let connection_result = connection.await;
    channel_result.and(connection_result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_field_table_round_trip_of_supported_values() {
        let mut headers = BTreeMap::new();
        headers.insert("Switchyard:MessageId".to_string(), WireValue::from("m-1"));
        headers.insert("count".to_string(), WireValue::Integer(3));
        headers.insert("flag".to_string(), WireValue::Boolean(true));

        let table = to_field_table(headers.clone());
        let decoded: BTreeMap<String, WireValue> = table
            .inner()
            .iter()
            .filter_map(|(k, v)| from_amqp_value(v).map(|v| (k.as_str().to_string(), v)))
            .collect();

        assert_eq!(decoded, headers);
    }

    #[test]
    fn test_numeric_amqp_values_widen_to_integer() {
        assert_eq!(
            from_amqp_value(&AMQPValue::ShortUInt(7)),
            Some(WireValue::Integer(7))
        );
        assert_eq!(
            from_amqp_value(&AMQPValue::ShortString(ShortString::from("x"))),
            Some(WireValue::from("x"))
        );
        assert_eq!(from_amqp_value(&AMQPValue::Void), None);
    }

    #[tokio::test]
    async fn test_connection_closed_even_when_channel_close_fails() {
        let connection_closed = AtomicBool::new(false);

        let result = close_in_order(
            async { Err(BusError::Connection("channel already closed".to_string())) },
            async {
                connection_closed.store(true, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(connection_closed.load(Ordering::SeqCst));
        assert!(matches!(result, Err(BusError::Connection(msg)) if msg.contains("channel")));
    }

    #[tokio::test]
    async fn test_connection_close_error_is_reported() {
        let result = close_in_order(async { Ok(()) }, async {
            Err(BusError::Connection("connection reset".to_string()))
        })
        .await;

        assert!(matches!(result, Err(BusError::Connection(msg)) if msg.contains("connection")));
    }

    #[test]
    fn test_factory_always_attempts_once() {
        let factory = LapinConnectionFactory::new("amqp://localhost:5672").with_max_attempts(0);
        assert_eq!(factory.max_attempts, 1);
    }
}
