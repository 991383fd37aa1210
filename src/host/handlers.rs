//! Handler traits, per-message contexts and closure adapters.

use std::any::type_name;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::Dispatcher;
use crate::message::{Command, CommandMessage, Event, EventMessage, HeaderBag, Message};

/// Error raised by application handlers.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one handler invocation.
pub type HandlerResult = Result<(), HandlerError>;

// ============================================================================
// Contexts
// ============================================================================

/// A received command and its envelope.
#[derive(Debug)]
pub struct CommandContext<T: Command> {
    message: CommandMessage<T>,
    received_on: DateTime<Utc>,
}

impl<T: Command> CommandContext<T> {
    pub fn new(message: CommandMessage<T>) -> Self {
        Self {
            message,
            received_on: Utc::now(),
        }
    }

    pub fn command(&self) -> &T {
        &self.message.command
    }

    pub fn command_arc(&self) -> Arc<T> {
        Arc::clone(&self.message.command)
    }

    pub fn message(&self) -> &CommandMessage<T> {
        &self.message
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn headers(&self) -> &HeaderBag {
        &self.message.headers
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.headers.correlation_id()
    }

    pub fn retry_count(&self) -> u32 {
        self.message.headers.retry_count()
    }

    pub fn received_on(&self) -> DateTime<Utc> {
        self.received_on
    }
}

/// A received event and its envelope.
#[derive(Debug)]
pub struct EventContext<T: Event> {
    message: EventMessage<T>,
    received_on: DateTime<Utc>,
}

impl<T: Event> EventContext<T> {
    pub fn new(message: EventMessage<T>) -> Self {
        Self {
            message,
            received_on: Utc::now(),
        }
    }

    pub fn event(&self) -> &T {
        &self.message.event
    }

    pub fn event_arc(&self) -> Arc<T> {
        Arc::clone(&self.message.event)
    }

    pub fn message(&self) -> &EventMessage<T> {
        &self.message
    }

    pub fn message_id(&self) -> &str {
        &self.message.message_id
    }

    pub fn headers(&self) -> &HeaderBag {
        &self.message.headers
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.message.headers.correlation_id()
    }

    pub fn retry_count(&self) -> u32 {
        self.message.headers.retry_count()
    }

    pub fn received_on(&self) -> DateTime<Utc> {
        self.received_on
    }
}

// ============================================================================
// Handler traits
// ============================================================================

/// Handles one command type.
///
/// The dispatcher sends further messages under the inbound correlation id.
#[async_trait]
pub trait CommandHandler<T: Command>: Send + Sync {
    async fn handle(&self, dispatcher: Dispatcher, context: CommandContext<T>) -> HandlerResult;
}

/// Handles one event type.
#[async_trait]
pub trait EventHandler<T: Event>: Send + Sync {
    async fn handle(&self, dispatcher: Dispatcher, context: EventContext<T>) -> HandlerResult;
}

/// Command handler backed by a closure.
pub struct DelegateCommandHandler<T, F> {
    handler: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> DelegateCommandHandler<T, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> CommandHandler<T> for DelegateCommandHandler<T, F>
where
    T: Command,
    F: Fn(Dispatcher, CommandContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, dispatcher: Dispatcher, context: CommandContext<T>) -> HandlerResult {
        (self.handler)(dispatcher, context).await
    }
}

/// Event handler backed by a closure.
pub struct DelegateEventHandler<T, F> {
    handler: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> DelegateEventHandler<T, F> {
    pub fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F, Fut> EventHandler<T> for DelegateEventHandler<T, F>
where
    T: Event,
    F: Fn(Dispatcher, EventContext<T>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn handle(&self, dispatcher: Dispatcher, context: EventContext<T>) -> HandlerResult {
        (self.handler)(dispatcher, context).await
    }
}

// ============================================================================
// Type erasure
// ============================================================================

/// Handler invoked with an untyped envelope.
#[async_trait]
pub(crate) trait MessageHandler: Send + Sync {
    async fn invoke(&self, dispatcher: Dispatcher, message: Message) -> HandlerResult;
}

fn payload_mismatch<T>(message: &Message) -> HandlerError {
    format!(
        "Payload of type {} cannot be handled as {}",
        message.payload_type_name(),
        type_name::<T>()
    )
    .into()
}

pub(crate) struct CommandHandlerAdapter<T, H> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T, H> CommandHandlerAdapter<T, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> MessageHandler for CommandHandlerAdapter<T, H>
where
    T: Command,
    H: CommandHandler<T>,
{
    async fn invoke(&self, dispatcher: Dispatcher, message: Message) -> HandlerResult {
        let typed = CommandMessage::<T>::try_from(message)
            .map_err(|message| payload_mismatch::<T>(&message))?;
        self.handler
            .handle(dispatcher, CommandContext::new(typed))
            .await
    }
}

pub(crate) struct EventHandlerAdapter<T, H> {
    handler: H,
    _marker: PhantomData<fn(T)>,
}

impl<T, H> EventHandlerAdapter<T, H> {
    pub(crate) fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, H> MessageHandler for EventHandlerAdapter<T, H>
where
    T: Event,
    H: EventHandler<T>,
{
    async fn invoke(&self, dispatcher: Dispatcher, message: Message) -> HandlerResult {
        let typed = EventMessage::<T>::try_from(message)
            .map_err(|message| payload_mismatch::<T>(&message))?;
        self.handler.handle(dispatcher, EventContext::new(typed)).await
    }
}
