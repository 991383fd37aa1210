//! Mock broker channel for testing the RabbitMQ engine without a broker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::bus::rabbitmq::{
    BrokerChannel, ConnectionFactory, Delivery, DeliveryStream, ExchangeOptions, OutboundMessage,
    QueueOptions,
};
use crate::bus::{BusError, Result};

/// One recorded channel operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerCall {
    DeclareExchange {
        name: String,
        options: ExchangeOptions,
    },
    DeclareQueue {
        name: String,
        options: QueueOptions,
    },
    BindQueue {
        queue: String,
        exchange: String,
        routing_key: String,
    },
    Qos {
        count: u16,
        global: bool,
    },
    Consume {
        queue: String,
    },
    Publish {
        exchange: String,
        routing_key: String,
        message: OutboundMessage,
    },
    Ack {
        delivery_tag: u64,
    },
    Nack {
        delivery_tag: u64,
        requeue: bool,
    },
    Close,
}

#[derive(Default)]
struct Inner {
    calls: RwLock<Vec<BrokerCall>>,
    consumers: RwLock<HashMap<String, mpsc::UnboundedSender<Result<Delivery>>>>,
    connections: AtomicUsize,
    generated_queues: AtomicUsize,
    closed: AtomicBool,
    fail_on_connect: AtomicBool,
}

/// Records every channel operation and lets tests inject deliveries.
///
/// Cloning shares state: hand one clone to the engine as its
/// `ConnectionFactory` and keep another to inspect and drive it.
#[derive(Clone, Default)]
pub struct MockBroker {
    inner: Arc<Inner>,
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `connect` fail.
    pub fn set_fail_on_connect(&self, fail: bool) {
        self.inner.fail_on_connect.store(fail, Ordering::SeqCst);
    }

    /// Simulate a dropped connection: ack, nack and publish fail from now on.
    pub fn set_closed(&self, closed: bool) {
        self.inner.closed.store(closed, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.load(Ordering::SeqCst)
    }

    pub async fn calls(&self) -> Vec<BrokerCall> {
        self.inner.calls.read().await.clone()
    }

    pub async fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.inner
            .calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Publish {
                    exchange, message, ..
                } => Some((exchange.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    pub async fn acks(&self) -> Vec<u64> {
        self.inner
            .calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Ack { delivery_tag } => Some(*delivery_tag),
                _ => None,
            })
            .collect()
    }

    pub async fn nacks(&self) -> Vec<(u64, bool)> {
        self.inner
            .calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Nack {
                    delivery_tag,
                    requeue,
                } => Some((*delivery_tag, *requeue)),
                _ => None,
            })
            .collect()
    }

    pub async fn qos_requests(&self) -> Vec<u16> {
        self.inner
            .calls
            .read()
            .await
            .iter()
            .filter_map(|call| match call {
                BrokerCall::Qos { count, .. } => Some(*count),
                _ => None,
            })
            .collect()
    }

    /// Queues a consumer has been started on.
    pub async fn consumed_queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.inner.consumers.read().await.keys().cloned().collect();
        queues.sort();
        queues
    }

    /// Push a delivery to the consumer of `queue`. Returns `false` if nothing
    /// consumes that queue.
    pub async fn deliver(&self, queue: &str, delivery: Delivery) -> bool {
        match self.inner.consumers.read().await.get(queue) {
            Some(sender) => sender.send(Ok(delivery)).is_ok(),
            None => false,
        }
    }

    /// Push a transport error to the consumer of `queue`.
    pub async fn fail_consumer(&self, queue: &str, error: BusError) -> bool {
        match self.inner.consumers.read().await.get(queue) {
            Some(sender) => sender.send(Err(error)).is_ok(),
            None => false,
        }
    }

    async fn record(&self, call: BrokerCall) {
        self.inner.calls.write().await.push(call);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock channel closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for MockBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerChannel>> {
        if self.inner.fail_on_connect.load(Ordering::SeqCst) {
            return Err(BusError::Connection("Mock connect failure".to_string()));
        }
        self.inner.connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl BrokerChannel for MockBroker {
    async fn declare_exchange(&self, name: &str, options: &ExchangeOptions) -> Result<()> {
        self.record(BrokerCall::DeclareExchange {
            name: name.to_string(),
            options: *options,
        })
        .await;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: &QueueOptions) -> Result<String> {
        self.record(BrokerCall::DeclareQueue {
            name: name.to_string(),
            options: options.clone(),
        })
        .await;

        if name.is_empty() {
            let n = self.inner.generated_queues.fetch_add(1, Ordering::SeqCst);
            Ok(format!("amq.gen-{}", n))
        } else {
            Ok(name.to_string())
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.record(BrokerCall::BindQueue {
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        })
        .await;
        Ok(())
    }

    async fn set_prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.record(BrokerCall::Qos { count, global }).await;
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<DeliveryStream> {
        self.record(BrokerCall::Consume {
            queue: queue.to_string(),
        })
        .await;

        let (sender, receiver) = mpsc::unbounded_channel();
        self.inner
            .consumers
            .write()
            .await
            .insert(queue.to_string(), sender);
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Publish {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message,
        })
        .await;
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Ack { delivery_tag }).await;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.record(BrokerCall::Nack {
            delivery_tag,
            requeue,
        })
        .await;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.record(BrokerCall::Close).await;
        self.inner.consumers.write().await.clear();
        Ok(())
    }
}
