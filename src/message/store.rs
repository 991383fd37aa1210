//! Registry of subscribed message types.
//!
//! Each engine owns one store. Types are registered while the engine is being
//! configured; once the engine starts, the store is frozen behind an `Arc` and
//! only read on the receive path to turn a wire descriptor back into a typed
//! payload.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use super::{Command, ErasedPayload, Event, HeaderBag, Message, MessageDescriptor, MessageType};

type DecodeFn = dyn Fn(Value) -> Result<Arc<dyn ErasedPayload>, serde_json::Error> + Send + Sync;

/// A subscribed message type together with the factory that rebuilds its
/// payload from a codec value.
#[derive(Clone)]
pub struct MessageRegistration {
    type_id: TypeId,
    type_name: &'static str,
    descriptor: MessageDescriptor,
    message_type: MessageType,
    decode: Arc<DecodeFn>,
}

impl MessageRegistration {
    pub fn command<T: Command>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            descriptor: T::descriptor(),
            message_type: MessageType::Command,
            decode: Arc::new(|value| {
                let command: T = serde_json::from_value(value)?;
                Ok(Arc::new(command) as Arc<dyn ErasedPayload>)
            }),
        }
    }

    pub fn event<T: Event>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            descriptor: T::descriptor(),
            message_type: MessageType::Event,
            decode: Arc::new(|value| {
                let event: T = serde_json::from_value(value)?;
                Ok(Arc::new(event) as Arc<dyn ErasedPayload>)
            }),
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn descriptor(&self) -> &MessageDescriptor {
        &self.descriptor
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Build an envelope of the registered type from a decoded codec value.
    pub fn decode(
        &self,
        message_id: String,
        headers: HeaderBag,
        value: Value,
    ) -> Result<Message, serde_json::Error> {
        let payload = (self.decode)(value)?;
        Ok(Message::from_parts(
            message_id,
            self.message_type,
            self.descriptor.clone(),
            self.type_id,
            self.type_name,
            headers,
            payload,
        ))
    }
}

impl fmt::Debug for MessageRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageRegistration")
            .field("type_name", &self.type_name)
            .field("descriptor", &self.descriptor.to_string())
            .field("message_type", &self.message_type)
            .finish()
    }
}

/// One class of registrations (commands or events).
#[derive(Debug, Clone, Default)]
struct Registry {
    registrations: Vec<MessageRegistration>,
    by_descriptor: HashMap<MessageDescriptor, usize>,
}

impl Registry {
    fn contains(&self, type_id: TypeId) -> bool {
        self.registrations.iter().any(|r| r.type_id == type_id)
    }

    fn insert(&mut self, registration: MessageRegistration) -> bool {
        if self.contains(registration.type_id) {
            return false;
        }

        if let Some(&index) = self.by_descriptor.get(&registration.descriptor) {
            warn!(
                descriptor = %registration.descriptor,
                registered = self.registrations[index].type_name,
                rejected = registration.type_name,
                "Descriptor already claimed by another type"
            );
            return false;
        }

        self.by_descriptor
            .insert(registration.descriptor.clone(), self.registrations.len());
        self.registrations.push(registration);
        true
    }

    fn find(&self, descriptor: &MessageDescriptor) -> Option<&MessageRegistration> {
        self.by_descriptor
            .get(descriptor)
            .map(|&index| &self.registrations[index])
    }
}

/// Bidirectional mapping between message types and their descriptors.
#[derive(Debug, Clone, Default)]
pub struct MessageDescriptorStore {
    commands: Registry,
    events: Registry,
}

impl MessageDescriptorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a type under its class. Returns `false` if it was already
    /// registered, or if another type of the same class already owns its
    /// descriptor.
    pub fn register(&mut self, registration: MessageRegistration) -> bool {
        match registration.message_type {
            MessageType::Command => self.commands.insert(registration),
            MessageType::Event => self.events.insert(registration),
        }
    }

    pub fn register_command<T: Command>(&mut self) -> bool {
        self.register(MessageRegistration::command::<T>())
    }

    pub fn register_event<T: Event>(&mut self) -> bool {
        self.register(MessageRegistration::event::<T>())
    }

    /// Exact lookup among registered commands. Never guesses.
    pub fn find_command_type_for_descriptor(
        &self,
        descriptor: &MessageDescriptor,
    ) -> Option<&MessageRegistration> {
        self.commands.find(descriptor)
    }

    /// Exact lookup among registered events. Never guesses.
    pub fn find_event_type_for_descriptor(
        &self,
        descriptor: &MessageDescriptor,
    ) -> Option<&MessageRegistration> {
        self.events.find(descriptor)
    }

    /// Resolve a descriptor, commands first.
    pub fn find(&self, descriptor: &MessageDescriptor) -> Option<&MessageRegistration> {
        self.find_command_type_for_descriptor(descriptor)
            .or_else(|| self.find_event_type_for_descriptor(descriptor))
    }

    pub fn has_commands(&self) -> bool {
        !self.commands.registrations.is_empty()
    }

    pub fn has_events(&self) -> bool {
        !self.events.registrations.is_empty()
    }

    pub fn commands(&self) -> impl Iterator<Item = &MessageRegistration> {
        self.commands.registrations.iter()
    }

    pub fn events(&self) -> impl Iterator<Item = &MessageRegistration> {
        self.events.registrations.iter()
    }

    /// Whether a payload type is registered in either class.
    pub fn is_type_accepted(&self, type_id: TypeId) -> bool {
        self.commands.contains(type_id) || self.events.contains(type_id)
    }

    pub fn is_empty(&self) -> bool {
        !self.has_commands() && !self.has_events()
    }
}
