//! Mock bus engine and broker for testing.

use async_trait::async_trait;
use tokio::sync::{mpsc, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use super::{BusEngine, BusError, EngineState, MessageStream, Result};
use crate::message::{Message, MessageDescriptorStore, MessageRegistration};

mod broker;

pub use broker::{BrokerCall, MockBroker};

/// Channel capacity for injected messages.
const CHANNEL_CAPACITY: usize = 64;

/// Mock bus engine for testing.
///
/// Records every send and every success/fail notification; `deliver` pushes
/// a message into the stream returned by `start`.
#[derive(Default)]
pub struct MockBusEngine {
    state: RwLock<EngineState>,
    store: RwLock<MessageDescriptorStore>,
    sender: RwLock<Option<mpsc::Sender<Message>>>,
    sent_commands: RwLock<Vec<Message>>,
    sent_events: RwLock<Vec<Message>>,
    succeeded: RwLock<Vec<Message>>,
    failed: RwLock<Vec<Message>>,
    fail_on_send: RwLock<bool>,
    fail_on_notify: RwLock<bool>,
}

impl MockBusEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.fail_on_send.write().await = fail;
    }

    pub async fn set_fail_on_notify(&self, fail: bool) {
        *self.fail_on_notify.write().await = fail;
    }

    /// Push a message into the started stream.
    pub async fn deliver(&self, message: Message) -> Result<()> {
        let sender = self.sender.read().await.clone().ok_or(BusError::NotStarted)?;
        sender
            .send(message)
            .await
            .map_err(|_| BusError::Connection("Mock stream dropped".to_string()))
    }

    pub async fn registrations(&self) -> MessageDescriptorStore {
        self.store.read().await.clone()
    }

    pub async fn sent_commands(&self) -> Vec<Message> {
        self.sent_commands.read().await.clone()
    }

    pub async fn sent_events(&self) -> Vec<Message> {
        self.sent_events.read().await.clone()
    }

    pub async fn succeeded(&self) -> Vec<Message> {
        self.succeeded.read().await.clone()
    }

    pub async fn failed(&self) -> Vec<Message> {
        self.failed.read().await.clone()
    }

    /// Number of sends plus notifications recorded so far.
    pub async fn outcome_count(&self) -> usize {
        self.sent_commands.read().await.len()
            + self.sent_events.read().await.len()
            + self.succeeded.read().await.len()
            + self.failed.read().await.len()
    }

    async fn check_send(&self) -> Result<()> {
        if *self.fail_on_send.read().await {
            return Err(BusError::Publish("Mock send failure".to_string()));
        }
        Ok(())
    }

    async fn check_notify(&self) -> Result<()> {
        if *self.fail_on_notify.read().await {
            return Err(BusError::Acknowledge("Mock notify failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BusEngine for MockBusEngine {
    async fn subscribe(&self, registration: MessageRegistration) -> Result<bool> {
        self.state.read().await.ensure_created()?;
        Ok(self.store.write().await.register(registration))
    }

    async fn start(&self) -> Result<MessageStream> {
        let mut state = self.state.write().await;
        state.ensure_created()?;

        let (sender, receiver) = mpsc::channel(CHANNEL_CAPACITY);
        *self.sender.write().await = Some(sender);
        *state = EngineState::Started;

        Ok(ReceiverStream::new(receiver))
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.write().await;
        if *state == EngineState::Started {
            *state = EngineState::Stopped;
            self.sender.write().await.take();
        }
        Ok(())
    }

    async fn send_command(&self, message: Message) -> Result<()> {
        self.check_send().await?;
        self.sent_commands.write().await.push(message);
        Ok(())
    }

    async fn send_event(&self, message: Message) -> Result<()> {
        self.check_send().await?;
        self.sent_events.write().await.push(message);
        Ok(())
    }

    async fn notify_success(&self, message: &Message) -> Result<()> {
        self.check_notify().await?;
        self.succeeded.write().await.push(message.clone());
        Ok(())
    }

    async fn notify_fail(&self, message: &Message) -> Result<()> {
        self.check_notify().await?;
        self.failed.write().await.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BusEngineExt;
    use crate::message::Command;
    use futures::StreamExt;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Refund {
        amount: u32,
    }
    impl Command for Refund {}

    #[tokio::test]
    async fn test_mock_engine_records_sends() {
        let engine = MockBusEngine::new();

        engine
            .send_command(Message::command(Refund { amount: 5 }))
            .await
            .unwrap();

        assert_eq!(engine.sent_commands().await.len(), 1);
        assert_eq!(engine.outcome_count().await, 1);
    }

    #[tokio::test]
    async fn test_mock_engine_fail_on_send() {
        let engine = MockBusEngine::new();
        engine.set_fail_on_send(true).await;

        let result = engine.send_command(Message::command(Refund { amount: 5 })).await;

        assert!(matches!(result, Err(BusError::Publish(_))));
        assert!(engine.sent_commands().await.is_empty());
    }

    #[tokio::test]
    async fn test_mock_engine_delivers_to_stream() {
        let engine = MockBusEngine::new();
        engine.subscribe_to_command::<Refund>().await.unwrap();
        let mut stream = engine.start().await.unwrap();

        engine
            .deliver(Message::command(Refund { amount: 9 }))
            .await
            .unwrap();

        let message = stream.next().await.unwrap();
        assert_eq!(message.payload::<Refund>(), Some(&Refund { amount: 9 }));
    }

    #[tokio::test]
    async fn test_mock_engine_deliver_before_start_fails() {
        let engine = MockBusEngine::new();

        let result = engine.deliver(Message::command(Refund { amount: 1 })).await;

        assert!(matches!(result, Err(BusError::NotStarted)));
    }

    #[tokio::test]
    async fn test_mock_engine_stop_ends_stream() {
        let engine = MockBusEngine::new();
        let mut stream = engine.start().await.unwrap();

        engine.stop().await.unwrap();

        assert!(stream.next().await.is_none());
    }
}
