//! RabbitMQ bus engine.
//!
//! Topology:
//! - one fanout exchange per message descriptor (name = descriptor string)
//! - one queue for all subscribed commands, bound to every command exchange
//! - one queue for all subscribed events, bound to every event exchange
//! - routing key always empty
//!
//! Each queue gets one receive task that decodes deliveries and feeds a
//! bounded channel; the receiving half is the stream returned by `start`.
//! All channel I/O (declare, publish, ack, nack, QoS, close) goes through a
//! single async mutex because an AMQP channel must not be used concurrently.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{BusEngine, BusError, EngineState, MessageStream, Result};
use crate::config::{ConfigError, QueueConfig, RabbitMqConfig};
use crate::message::{Message, MessageDescriptor, MessageDescriptorStore, MessageRegistration};
use crate::serialization::{
    resolve_encoding, resolve_inbound_encoding, JsonSerializer, SerializationError, Serializer,
};

#[cfg(feature = "amqp")]
mod amqp;
pub mod transport;
pub mod wire;

#[cfg(feature = "amqp")]
pub use amqp::LapinConnectionFactory;
pub use transport::{
    BrokerChannel, ConnectionFactory, Delivery, DeliveryStream, ExchangeOptions, OutboundMessage,
    QueueFactory, QueueOptions, StaticQueueFactory, TemporaryQueueFactory, WireValue,
};

/// Stream capacity when no unacknowledged-message limit is configured.
const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Options of the dead-letter exchange itself.
const DEAD_LETTER_EXCHANGE_OPTIONS: ExchangeOptions = ExchangeOptions {
    durable: true,
    auto_delete: false,
};

/// Build the queue factory selected by configuration.
pub fn queue_factory(config: &QueueConfig) -> std::result::Result<Arc<dyn QueueFactory>, ConfigError> {
    match config {
        QueueConfig::Static { queue_name } if queue_name.trim().is_empty() => {
            Err(ConfigError::InvalidValue {
                field: "queue_name",
                reason: "static queues need a name".to_string(),
            })
        }
        QueueConfig::Static { queue_name } => Ok(Arc::new(StaticQueueFactory::new(queue_name))),
        QueueConfig::Temporary => Ok(Arc::new(TemporaryQueueFactory)),
    }
}

// ============================================================================
// Options
// ============================================================================

/// Engine options, validated at construction.
#[derive(Clone)]
pub struct RabbitMqOptions {
    /// Text encoding of outbound payloads.
    pub outbound_encoding: &'static Encoding,
    /// Queue all subscribed commands are consumed from.
    pub command_queue: Arc<dyn QueueFactory>,
    /// Queue all subscribed events are consumed from.
    pub event_queue: Arc<dyn QueueFactory>,
    pub command_exchange: ExchangeOptions,
    pub event_exchange: ExchangeOptions,
    /// Global QoS prefetch. `None` leaves the broker default.
    pub unacked_message_count_limit: Option<u16>,
    /// Rejected deliveries go here instead of being requeued.
    pub dead_letter_exchange: Option<String>,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        Self {
            outbound_encoding: UTF_8,
            command_queue: Arc::new(TemporaryQueueFactory),
            event_queue: Arc::new(TemporaryQueueFactory),
            command_exchange: ExchangeOptions::default(),
            event_exchange: ExchangeOptions::default(),
            unacked_message_count_limit: None,
            dead_letter_exchange: None,
        }
    }
}

impl RabbitMqOptions {
    /// Validate configuration. Unknown encodings and unnamed static queues
    /// are configuration errors.
    pub fn from_config(config: &RabbitMqConfig) -> std::result::Result<Self, ConfigError> {
        let outbound_encoding = resolve_encoding(&config.outbound_encoding)
            .map_err(|_| ConfigError::InvalidEncoding(config.outbound_encoding.clone()))?;

        let dead_letter_exchange = config
            .dead_letter_exchange
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);

        Ok(Self {
            outbound_encoding,
            command_queue: queue_factory(&config.command_queue)?,
            event_queue: queue_factory(&config.event_queue)?,
            command_exchange: config.command_exchange,
            event_exchange: config.event_exchange,
            unacked_message_count_limit: config.unacked_message_count_limit,
            dead_letter_exchange,
        })
    }

    pub fn with_outbound_encoding(
        mut self,
        label: &str,
    ) -> std::result::Result<Self, ConfigError> {
        self.outbound_encoding =
            resolve_encoding(label).map_err(|_| ConfigError::InvalidEncoding(label.to_string()))?;
        Ok(self)
    }

    pub fn with_command_queue(mut self, factory: impl QueueFactory + 'static) -> Self {
        self.command_queue = Arc::new(factory);
        self
    }

    pub fn with_event_queue(mut self, factory: impl QueueFactory + 'static) -> Self {
        self.event_queue = Arc::new(factory);
        self
    }

    pub fn with_unacked_message_count_limit(mut self, limit: u16) -> Self {
        self.unacked_message_count_limit = Some(limit);
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = Some(exchange.into());
        self
    }

    /// Nacks requeue unless a dead-letter exchange takes rejected deliveries.
    fn requeue_rejected(&self) -> bool {
        self.dead_letter_exchange.is_none()
    }
}

impl fmt::Debug for RabbitMqOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqOptions")
            .field("outbound_encoding", &self.outbound_encoding.name())
            .field("command_exchange", &self.command_exchange)
            .field("event_exchange", &self.event_exchange)
            .field(
                "unacked_message_count_limit",
                &self.unacked_message_count_limit,
            )
            .field("dead_letter_exchange", &self.dead_letter_exchange)
            .finish()
    }
}

// ============================================================================
// Receive path
// ============================================================================

/// Why a delivery was rejected before reaching the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Delivery has no message type header")]
    MissingMessageType,

    #[error("Invalid message type '{0}'")]
    InvalidDescriptor(String),

    #[error("No subscription for message type '{0}'")]
    UnknownDescriptor(MessageDescriptor),

    #[error("Payload could not be decoded: {0}")]
    Payload(#[from] SerializationError),

    #[error("Payload does not match '{descriptor}': {source}")]
    Shape {
        descriptor: MessageDescriptor,
        source: serde_json::Error,
    },
}

/// Turn a delivery into a typed envelope.
///
/// Commands are resolved before events. Unknown or missing content encodings
/// fall back to UTF-8.
pub fn decode_delivery(
    store: &MessageDescriptorStore,
    serializer: &dyn Serializer,
    delivery: Delivery,
) -> std::result::Result<Message, DecodeError> {
    let encoding = match delivery.content_encoding.as_deref() {
        Some(label) => resolve_inbound_encoding(label).unwrap_or_else(|| {
            warn!(
                delivery_tag = delivery.delivery_tag,
                content_encoding = %label,
                "Unknown content encoding, falling back to UTF-8"
            );
            UTF_8
        }),
        None => {
            warn!(
                delivery_tag = delivery.delivery_tag,
                "Delivery has no content encoding, falling back to UTF-8"
            );
            UTF_8
        }
    };

    let inbound = wire::decode_headers(&delivery.headers, delivery.delivery_tag);

    let type_name = inbound
        .message_type
        .ok_or(DecodeError::MissingMessageType)?;
    let descriptor = MessageDescriptor::try_parse(&type_name)
        .ok_or_else(|| DecodeError::InvalidDescriptor(type_name.clone()))?;
    let registration = store
        .find(&descriptor)
        .ok_or_else(|| DecodeError::UnknownDescriptor(descriptor.clone()))?;

    let value = serializer.deserialize(&delivery.body, encoding)?;

    let message_id = inbound
        .message_id
        .or(delivery.message_id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    registration
        .decode(message_id, inbound.headers, value)
        .map_err(|source| DecodeError::Shape { descriptor, source })
}

/// Channel plus the exchanges already declared on it.
struct OpenChannel {
    channel: Box<dyn BrokerChannel>,
    declared_exchanges: HashSet<String>,
}

impl OpenChannel {
    fn new(channel: Box<dyn BrokerChannel>) -> Self {
        Self {
            channel,
            declared_exchanges: HashSet::new(),
        }
    }

    async fn ensure_exchange(&mut self, name: &str, options: &ExchangeOptions) -> Result<()> {
        if self.declared_exchanges.contains(name) {
            return Ok(());
        }
        self.channel.declare_exchange(name, options).await?;
        self.declared_exchanges.insert(name.to_string());
        Ok(())
    }
}

type SharedChannel = Arc<Mutex<Option<OpenChannel>>>;

#[derive(Debug, Clone, Copy)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

/// Ack or nack a delivery. Transport failures are logged, never returned:
/// an unsettled delivery is redelivered by the broker.
async fn settle_delivery(channel: &SharedChannel, delivery_tag: u64, settlement: Settlement) {
    let guard = channel.lock().await;
    let Some(open) = guard.as_ref() else {
        warn!(
            delivery_tag,
            ?settlement,
            "Channel released, leaving delivery to broker redelivery"
        );
        return;
    };

    let result = match settlement {
        Settlement::Ack => open.channel.ack(delivery_tag).await,
        Settlement::Nack { requeue } => open.channel.nack(delivery_tag, requeue).await,
    };

    if let Err(e) = result {
        warn!(
            delivery_tag,
            ?settlement,
            error = %e,
            "Failed to settle delivery, broker will redeliver"
        );
    }
}

struct ReceiveContext {
    store: Arc<MessageDescriptorStore>,
    serializer: Arc<dyn Serializer>,
    channel: SharedChannel,
    requeue_rejected: bool,
}

async fn receive_loop(
    queue: String,
    mut deliveries: DeliveryStream,
    context: Arc<ReceiveContext>,
    sender: mpsc::Sender<Message>,
) {
    while let Some(delivery) = deliveries.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                error!(queue = %queue, error = %e, "Consumer delivery error, stopping consumer");
                break;
            }
        };

        let delivery_tag = delivery.delivery_tag;
        match decode_delivery(&context.store, context.serializer.as_ref(), delivery) {
            Ok(message) => {
                debug!(
                    queue = %queue,
                    delivery_tag,
                    message_id = %message.message_id,
                    descriptor = %message.descriptor(),
                    "Received message"
                );
                if sender.send(message).await.is_err() {
                    info!(queue = %queue, "Message stream dropped, stopping consumer");
                    break;
                }
            }
            Err(e) => {
                warn!(
                    queue = %queue,
                    delivery_tag,
                    error = %e,
                    requeue = context.requeue_rejected,
                    "Rejecting undecodable delivery"
                );
                settle_delivery(
                    &context.channel,
                    delivery_tag,
                    Settlement::Nack {
                        requeue: context.requeue_rejected,
                    },
                )
                .await;
            }
        }
    }

    info!(queue = %queue, "Consumer stream ended");
}

/// Engine-owned binding of a queue to its receive task.
struct Consumer {
    queue: String,
    task: JoinHandle<()>,
}

// ============================================================================
// Engine
// ============================================================================

/// Bus engine backed by RabbitMQ.
pub struct RabbitMqBusEngine {
    options: RabbitMqOptions,
    connection_factory: Arc<dyn ConnectionFactory>,
    serializer: Arc<dyn Serializer>,
    store: RwLock<MessageDescriptorStore>,
    state: Mutex<EngineState>,
    channel: SharedChannel,
    consumers: Mutex<Vec<Consumer>>,
    /// Keeps the stream open when nothing is consumed.
    idle_sender: Mutex<Option<mpsc::Sender<Message>>>,
}

impl RabbitMqBusEngine {
    /// Create an engine. No connection is made until `start`.
    pub fn new(options: RabbitMqOptions, connection_factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            options,
            connection_factory,
            serializer: Arc::new(JsonSerializer),
            store: RwLock::new(MessageDescriptorStore::new()),
            state: Mutex::new(EngineState::Created),
            channel: Arc::new(Mutex::new(None)),
            consumers: Mutex::new(Vec::new()),
            idle_sender: Mutex::new(None),
        }
    }

    /// Replace the payload codec.
    pub fn with_serializer(mut self, serializer: Arc<dyn Serializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn options(&self) -> &RabbitMqOptions {
        &self.options
    }

    /// Names of the queues being consumed.
    pub async fn consumer_queues(&self) -> Vec<String> {
        self.consumers
            .lock()
            .await
            .iter()
            .map(|consumer| consumer.queue.clone())
            .collect()
    }

    /// Declare a class queue and bind it to the exchange of every descriptor.
    async fn bind_class(
        open: &mut OpenChannel,
        factory: &dyn QueueFactory,
        exchanges: Vec<String>,
        exchange_options: &ExchangeOptions,
        dead_letter_exchange: Option<&str>,
    ) -> Result<String> {
        let queue = factory
            .create_queue(open.channel.as_ref(), dead_letter_exchange)
            .await?;

        for exchange in exchanges {
            open.ensure_exchange(&exchange, exchange_options).await?;
            open.channel.bind_queue(&queue, &exchange, "").await?;
            info!(queue = %queue, exchange = %exchange, "Bound queue to exchange");
        }

        Ok(queue)
    }

    async fn declare_topology(
        &self,
        open: &mut OpenChannel,
        store: &MessageDescriptorStore,
    ) -> Result<Vec<(String, DeliveryStream)>> {
        let dead_letter_exchange = self.options.dead_letter_exchange.as_deref();

        if let Some(exchange) = dead_letter_exchange {
            open.ensure_exchange(exchange, &DEAD_LETTER_EXCHANGE_OPTIONS)
                .await?;
        }

        if let Some(limit) = self.options.unacked_message_count_limit {
            open.channel.set_prefetch(limit, true).await?;
        }

        let mut queues = Vec::new();

        if store.has_commands() {
            let exchanges: Vec<String> = store.commands().map(|r| r.descriptor().to_string()).collect();
            let queue = Self::bind_class(
                open,
                self.options.command_queue.as_ref(),
                exchanges,
                &self.options.command_exchange,
                dead_letter_exchange,
            )
            .await?;
            queues.push(queue);
        }

        if store.has_events() {
            let exchanges: Vec<String> = store.events().map(|r| r.descriptor().to_string()).collect();
            let queue = Self::bind_class(
                open,
                self.options.event_queue.as_ref(),
                exchanges,
                &self.options.event_exchange,
                dead_letter_exchange,
            )
            .await?;
            queues.push(queue);
        }

        let mut streams = Vec::with_capacity(queues.len());
        for queue in queues {
            let deliveries = open.channel.consume(&queue).await?;
            streams.push((queue, deliveries));
        }

        Ok(streams)
    }

    async fn publish(&self, message: Message, exchange_options: &ExchangeOptions) -> Result<()> {
        self.state.lock().await.ensure_started()?;

        let encoding = self.options.outbound_encoding;
        let value = message.payload_value()?;
        let body = self.serializer.serialize(&value, encoding)?;
        let exchange = message.descriptor().to_string();

        let outbound = OutboundMessage {
            body,
            content_encoding: encoding.name().to_string(),
            message_id: message.message_id.clone(),
            headers: wire::encode_headers(&message),
            persistent: true,
        };

        let mut guard = self.channel.lock().await;
        let open = guard.as_mut().ok_or(BusError::Stopped)?;
        open.ensure_exchange(&exchange, exchange_options).await?;
        open.channel.publish(&exchange, "", outbound).await?;

        debug!(
            message_id = %message.message_id,
            exchange = %exchange,
            retry_count = message.retry_count(),
            "Published message"
        );
        Ok(())
    }

    async fn settle(&self, message: &Message, settlement: Settlement) -> Result<()> {
        let Some(delivery_tag) = wire::delivery_tag(&message.headers) else {
            warn!(
                message_id = %message.message_id,
                ?settlement,
                "Message carries no delivery tag, nothing to settle"
            );
            return Ok(());
        };

        settle_delivery(&self.channel, delivery_tag, settlement).await;
        Ok(())
    }
}

#[async_trait]
impl BusEngine for RabbitMqBusEngine {
    async fn subscribe(&self, registration: MessageRegistration) -> Result<bool> {
        self.state.lock().await.ensure_created()?;
        Ok(self.store.write().await.register(registration))
    }

    async fn start(&self) -> Result<MessageStream> {
        let mut state = self.state.lock().await;
        state.ensure_created()?;

        let store = Arc::new(self.store.read().await.clone());
        let channel = self.connection_factory.connect().await?;

        let streams = {
            let mut slot = self.channel.lock().await;
            let open = slot.insert(OpenChannel::new(channel));
            match self.declare_topology(open, &store).await {
                Ok(streams) => streams,
                Err(e) => {
                    error!(error = %e, "Failed to declare topology");
                    if let Some(open) = slot.take() {
                        if let Err(close_error) = open.channel.close().await {
                            warn!(error = %close_error, "Failed to close channel");
                        }
                    }
                    return Err(e);
                }
            }
        };

        let capacity = self
            .options
            .unacked_message_count_limit
            .map(usize::from)
            .filter(|limit| *limit > 0)
            .unwrap_or(DEFAULT_CHANNEL_CAPACITY);
        let (sender, receiver) = mpsc::channel(capacity);

        let context = Arc::new(ReceiveContext {
            store: Arc::clone(&store),
            serializer: Arc::clone(&self.serializer),
            channel: Arc::clone(&self.channel),
            requeue_rejected: self.options.requeue_rejected(),
        });

        let consumers: Vec<Consumer> = streams
            .into_iter()
            .map(|(queue, deliveries)| Consumer {
                task: tokio::spawn(receive_loop(
                    queue.clone(),
                    deliveries,
                    Arc::clone(&context),
                    sender.clone(),
                )),
                queue,
            })
            .collect();

        if consumers.is_empty() {
            info!("No subscriptions, message stream is idle");
            *self.idle_sender.lock().await = Some(sender);
        }

        info!(
            queues = ?consumers.iter().map(|c| c.queue.as_str()).collect::<Vec<_>>(),
            commands = store.commands().count(),
            events = store.events().count(),
            "RabbitMQ engine started"
        );

        *self.consumers.lock().await = consumers;
        *state = EngineState::Started;

        Ok(ReceiverStream::new(receiver))
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != EngineState::Started {
            return Ok(());
        }
        *state = EngineState::Stopped;

        for consumer in self.consumers.lock().await.drain(..) {
            consumer.task.abort();
            debug!(queue = %consumer.queue, "Consumer stopped");
        }
        self.idle_sender.lock().await.take();

        if let Some(open) = self.channel.lock().await.take() {
            if let Err(e) = open.channel.close().await {
                warn!(error = %e, "Failed to close channel");
            }
        }

        info!("RabbitMQ engine stopped");
        Ok(())
    }

    async fn send_command(&self, message: Message) -> Result<()> {
        self.publish(message, &self.options.command_exchange).await
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        self.publish(message, &self.options.event_exchange).await
    }

    async fn notify_success(&self, message: &Message) -> Result<()> {
        self.settle(message, Settlement::Ack).await
    }

    async fn notify_fail(&self, message: &Message) -> Result<()> {
        self.settle(
            message,
            Settlement::Nack {
                requeue: self.options.requeue_rejected(),
            },
        )
        .await
    }
}
