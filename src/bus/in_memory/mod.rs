//! In-memory bus engine for single-process use.
//!
//! Uses a bounded tokio mpsc channel as the pass-through conduit between the
//! send path and the produced stream. Ideal for local development and testing
//! without a broker.

use std::any::TypeId;

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info};

use super::{BusEngine, EngineState, MessageStream, Result};
use crate::message::{Message, MessageDescriptorStore, MessageRegistration};

/// Channel capacity for the pass-through conduit.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct Inner {
    state: EngineState,
    store: MessageDescriptorStore,
    sender: Option<mpsc::Sender<Message>>,
}

/// Bus engine that moves messages within one process.
///
/// Messages of unsubscribed types are accepted and dropped, as are messages
/// sent before `start` or after `stop`. There is no delivery to acknowledge,
/// so `notify_success` and `notify_fail` complete immediately.
#[derive(Default)]
pub struct InMemoryBusEngine {
    inner: RwLock<Inner>,
}

impl InMemoryBusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a payload type has been subscribed.
    pub async fn is_type_accepted(&self, type_id: TypeId) -> bool {
        self.inner.read().await.store.is_type_accepted(type_id)
    }

    async fn forward(&self, message: Message) -> Result<()> {
        let sender = {
            let inner = self.inner.read().await;
            if inner.state != EngineState::Started {
                debug!(
                    message_id = %message.message_id,
                    state = ?inner.state,
                    "Engine not running, message dropped"
                );
                return Ok(());
            }
            if !inner.store.is_type_accepted(message.payload_type()) {
                debug!(
                    message_id = %message.message_id,
                    descriptor = %message.descriptor(),
                    "No subscription for message type, message dropped"
                );
                return Ok(());
            }
            inner.sender.clone()
        };

        if let Some(sender) = sender {
            let message_id = message.message_id.clone();
            if sender.send(message).await.is_err() {
                debug!(message_id = %message_id, "Stream dropped, message discarded");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl BusEngine for InMemoryBusEngine {
    async fn subscribe(&self, registration: MessageRegistration) -> Result<bool> {
        let mut inner = self.inner.write().await;
        inner.state.ensure_created()?;
        Ok(inner.store.register(registration))
    }

    async fn start(&self) -> Result<MessageStream> {
        let mut inner = self.inner.write().await;
        inner.state.ensure_created()?;

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        inner.sender = Some(sender);
        inner.state = EngineState::Started;

        info!(
            commands = inner.store.commands().count(),
            events = inner.store.events().count(),
            "In-memory engine started"
        );

        Ok(ReceiverStream::new(receiver))
    }

    async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        if inner.state != EngineState::Started {
            return Ok(());
        }

        inner.state = EngineState::Stopped;
        inner.sender = None;

        info!("In-memory engine stopped");
        Ok(())
    }

    async fn send_command(&self, message: Message) -> Result<()> {
        self.forward(message).await
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        self.forward(message).await
    }

    async fn notify_success(&self, _message: &Message) -> Result<()> {
        Ok(())
    }

    async fn notify_fail(&self, _message: &Message) -> Result<()> {
        Ok(())
    }
}
