//! Switchyard - transport-agnostic command/event bus
//!
//! Producers raise typed commands and events; a `BusHost` routes them to
//! typed handlers. A pluggable `BusEngine` moves messages between the two,
//! either through RabbitMQ or within one process.

pub mod bus;
pub mod config;
pub mod host;
pub mod message;
pub mod policy;
pub mod serialization;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;

pub use bus::{init_bus_engine, BusEngine, BusEngineExt, BusError, InMemoryBusEngine};
pub use host::{BusHost, CommandContext, CommandHandler, Dispatcher, EventContext, EventHandler};
pub use message::{Command, CommandMessage, Event, EventMessage, Message, MessageDescriptor};
pub use policy::{ErrorPolicy, NoopErrorPolicy, RetryErrorPolicy};
