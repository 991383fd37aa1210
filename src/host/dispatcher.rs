//! Outbound side of the host: sending commands and raising events.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::HandlerError;
use crate::bus::{BusEngine, Result};
use crate::message::{Command, ControlHeader, Event, Message};

/// Outcome of dispatching one message to its handler.
pub enum DispatchResult {
    /// The handler completed.
    Handled,
    /// The handler returned an error or panicked.
    Failed(HandlerError),
    /// No handler is registered for the message's class and type.
    Unhandled,
}

impl DispatchResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Handled)
    }
}

impl fmt::Debug for DispatchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handled => f.write_str("Handled"),
            Self::Failed(error) => f.debug_tuple("Failed").field(&error.to_string()).finish(),
            Self::Unhandled => f.write_str("Unhandled"),
        }
    }
}

/// Stamp an outgoing message with correlation id and send time.
pub(crate) fn stamp_outgoing(message: &mut Message, correlation_id: &str) {
    message
        .headers
        .set_control(ControlHeader::CorrelationId, correlation_id);
    message
        .headers
        .set_control(ControlHeader::SentOn, Utc::now().to_rfc3339());
}

/// Sends messages on behalf of a handler.
///
/// Everything sent through a dispatcher carries the correlation id of the
/// message being handled.
#[derive(Clone)]
pub struct Dispatcher {
    engine: Arc<dyn BusEngine>,
    correlation_id: String,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn BusEngine>, correlation_id: impl Into<String>) -> Self {
        Self {
            engine,
            correlation_id: correlation_id.into(),
        }
    }

    /// Dispatcher starting a new correlation.
    pub fn uncorrelated(engine: Arc<dyn BusEngine>) -> Self {
        Self::new(engine, Uuid::new_v4().to_string())
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub async fn invoke_command<T: Command>(&self, command: T) -> Result<()> {
        self.send(Message::command(command)).await
    }

    pub async fn raise_event<T: Event>(&self, event: T) -> Result<()> {
        self.send(Message::event(event)).await
    }

    /// Stamp and send a prepared envelope, keeping its id and user headers.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        stamp_outgoing(&mut message, &self.correlation_id);
        debug!(
            message_id = %message.message_id,
            correlation_id = %self.correlation_id,
            descriptor = %message.descriptor(),
            "Sending message"
        );
        self.engine.send(message).await
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("correlation_id", &self.correlation_id)
            .finish_non_exhaustive()
    }
}
