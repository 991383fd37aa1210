//! Message model.
//!
//! This module contains:
//! - `Command` / `Event` marker traits for payload types
//! - `Message`: the type-erased envelope engines move around
//! - `CommandMessage<T>` / `EventMessage<T>`: typed views over `Message`
//! - `HeaderBag`, `MessageDescriptor` and `MessageDescriptorStore`

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

pub mod descriptor;
pub mod headers;
pub mod store;

pub use descriptor::{DescriptorParseError, MessageDescriptor, DESCRIPTOR_SEPARATOR};
pub use headers::{ControlHeader, HeaderBag, TransportKey};
pub use store::{MessageDescriptorStore, MessageRegistration};

// ============================================================================
// Payload traits
// ============================================================================

/// A request addressed to exactly one logical handler.
///
/// Override `descriptor` to publish under a stable name that does not follow
/// the Rust module path.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn descriptor() -> MessageDescriptor {
        MessageDescriptor::of::<Self>()
    }
}

/// A notification that something happened; any number of handlers may react.
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn descriptor() -> MessageDescriptor {
        MessageDescriptor::of::<Self>()
    }
}

/// Message class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Command,
    Event,
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command => f.write_str("Command"),
            Self::Event => f.write_str("Event"),
        }
    }
}

/// Object-safe view of a payload: serializable and downcastable.
pub trait ErasedPayload: Send + Sync + 'static {
    fn to_value(&self) -> Result<Value, serde_json::Error>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T> ErasedPayload for T
where
    T: Serialize + Send + Sync + 'static,
{
    fn to_value(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Type-erased envelope shared by every engine.
///
/// Cloning is cheap: the payload is reference counted.
#[derive(Clone)]
pub struct Message {
    /// Application-level message identifier.
    pub message_id: String,
    /// Control, transport and user headers.
    pub headers: HeaderBag,
    message_type: MessageType,
    descriptor: MessageDescriptor,
    payload_type: TypeId,
    payload_type_name: &'static str,
    payload: Arc<dyn ErasedPayload>,
}

impl Message {
    pub(crate) fn from_parts(
        message_id: String,
        message_type: MessageType,
        descriptor: MessageDescriptor,
        payload_type: TypeId,
        payload_type_name: &'static str,
        headers: HeaderBag,
        payload: Arc<dyn ErasedPayload>,
    ) -> Self {
        Self {
            message_id,
            headers,
            message_type,
            descriptor,
            payload_type,
            payload_type_name,
            payload,
        }
    }

    /// Wrap a command with a fresh message id and empty headers.
    pub fn command<T: Command>(command: T) -> Self {
        CommandMessage::new(command).into()
    }

    /// Wrap an event with a fresh message id and empty headers.
    pub fn event<T: Event>(event: T) -> Self {
        EventMessage::new(event).into()
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_command(&self) -> bool {
        self.message_type == MessageType::Command
    }

    pub fn is_event(&self) -> bool {
        self.message_type == MessageType::Event
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    /// `TypeId` of the payload's declared type.
    pub fn payload_type(&self) -> TypeId {
        self.payload_type
    }

    pub fn payload_type_name(&self) -> &'static str {
        self.payload_type_name
    }

    /// Borrow the payload as `T` if that is its type.
    pub fn payload<T: 'static>(&self) -> Option<&T> {
        self.payload.as_any().downcast_ref::<T>()
    }

    /// Shared handle to the payload as `T` if that is its type.
    pub fn payload_arc<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.payload).into_any().downcast::<T>().ok()
    }

    /// Payload as a codec value, ready for a `Serializer`.
    pub fn payload_value(&self) -> Result<Value, serde_json::Error> {
        self.payload.to_value()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.headers.correlation_id()
    }

    pub fn retry_count(&self) -> u32 {
        self.headers.retry_count()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("message_id", &self.message_id)
            .field("message_type", &self.message_type)
            .field("descriptor", &self.descriptor.to_string())
            .field("payload_type", &self.payload_type_name)
            .field("headers", &self.headers)
            .finish()
    }
}

// ============================================================================
// Typed views
// ============================================================================

/// Envelope for a command of type `T`.
pub struct CommandMessage<T: Command> {
    pub message_id: String,
    pub headers: HeaderBag,
    pub command: Arc<T>,
}

impl<T: Command> CommandMessage<T> {
    pub fn new(command: T) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), command)
    }

    pub fn with_id(message_id: impl Into<String>, command: T) -> Self {
        Self {
            message_id: message_id.into(),
            headers: HeaderBag::new(),
            command: Arc::new(command),
        }
    }
}

impl<T: Command> Clone for CommandMessage<T> {
    fn clone(&self) -> Self {
        Self {
            message_id: self.message_id.clone(),
            headers: self.headers.clone(),
            command: Arc::clone(&self.command),
        }
    }
}

impl<T: Command + fmt::Debug> fmt::Debug for CommandMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandMessage")
            .field("message_id", &self.message_id)
            .field("headers", &self.headers)
            .field("command", &self.command)
            .finish()
    }
}

impl<T: Command> From<CommandMessage<T>> for Message {
    fn from(message: CommandMessage<T>) -> Self {
        Message::from_parts(
            message.message_id,
            MessageType::Command,
            T::descriptor(),
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            message.headers,
            message.command,
        )
    }
}

impl<T: Command> TryFrom<Message> for CommandMessage<T> {
    type Error = Message;

    /// Recover the typed view; hands the envelope back if it is not a `T` command.
    fn try_from(message: Message) -> Result<Self, Self::Error> {
        if !message.is_command() {
            return Err(message);
        }
        match message.payload_arc::<T>() {
            Some(command) => Ok(Self {
                message_id: message.message_id,
                headers: message.headers,
                command,
            }),
            None => Err(message),
        }
    }
}

/// Envelope for an event of type `T`.
pub struct EventMessage<T: Event> {
    pub message_id: String,
    pub headers: HeaderBag,
    pub event: Arc<T>,
}

impl<T: Event> EventMessage<T> {
    pub fn new(event: T) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), event)
    }

    pub fn with_id(message_id: impl Into<String>, event: T) -> Self {
        Self {
            message_id: message_id.into(),
            headers: HeaderBag::new(),
            event: Arc::new(event),
        }
    }
}

impl<T: Event> Clone for EventMessage<T> {
    fn clone(&self) -> Self {
        Self {
            message_id: self.message_id.clone(),
            headers: self.headers.clone(),
            event: Arc::clone(&self.event),
        }
    }
}

impl<T: Event + fmt::Debug> fmt::Debug for EventMessage<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventMessage")
            .field("message_id", &self.message_id)
            .field("headers", &self.headers)
            .field("event", &self.event)
            .finish()
    }
}

impl<T: Event> From<EventMessage<T>> for Message {
    fn from(message: EventMessage<T>) -> Self {
        Message::from_parts(
            message.message_id,
            MessageType::Event,
            T::descriptor(),
            TypeId::of::<T>(),
            std::any::type_name::<T>(),
            message.headers,
            message.event,
        )
    }
}

impl<T: Event> TryFrom<Message> for EventMessage<T> {
    type Error = Message;

    fn try_from(message: Message) -> Result<Self, Self::Error> {
        if !message.is_event() {
            return Err(message);
        }
        match message.payload_arc::<T>() {
            Some(event) => Ok(Self {
                message_id: message.message_id,
                headers: message.headers,
                event,
            }),
            None => Err(message),
        }
    }
}

#[cfg(test)]
mod tests;
