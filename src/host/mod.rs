//! Bus host.
//!
//! The host owns the handler registry and the dispatch loop. It starts the
//! engine, pulls messages from the engine's stream and hands each one to its
//! handler, concurrently. Every message gets exactly one outcome:
//! - handler succeeded: `notify_success`
//! - handler failed or panicked: the error policy decides
//! - no handler: `notify_fail`

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{FutureExt, StreamExt};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::bus::{BusEngine, BusEngineExt, BusError, Result};
use crate::config::{ConfigError, HostConfig};
use crate::message::{Command, Event, Message, MessageDescriptor, MessageType};
use crate::policy::{ErrorPolicy, NoopErrorPolicy};

mod dispatcher;
mod handlers;

pub use dispatcher::{DispatchResult, Dispatcher};
pub use handlers::{
    CommandContext, CommandHandler, DelegateCommandHandler, DelegateEventHandler, EventContext,
    EventHandler, HandlerError, HandlerResult,
};

use handlers::{CommandHandlerAdapter, EventHandlerAdapter, MessageHandler};

type HandlerMap = HashMap<TypeId, Arc<dyn MessageHandler>>;

/// Handlers by message class, frozen when the dispatch loop starts.
#[derive(Default, Clone)]
struct HandlerTable {
    commands: HandlerMap,
    events: HandlerMap,
}

impl HandlerTable {
    fn resolve(&self, message: &Message) -> Option<Arc<dyn MessageHandler>> {
        let handlers = match message.message_type() {
            MessageType::Command => &self.commands,
            MessageType::Event => &self.events,
        };
        handlers.get(&message.payload_type()).cloned()
    }
}

/// State shared by every in-flight dispatch.
struct DispatchLoop {
    engine: Arc<dyn BusEngine>,
    error_policy: Arc<dyn ErrorPolicy>,
    handlers: HandlerTable,
    stopping: Arc<AtomicBool>,
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

impl DispatchLoop {
    async fn dispatch(&self, message: Message) -> DispatchResult {
        let Some(handler) = self.handlers.resolve(&message) else {
            return DispatchResult::Unhandled;
        };

        let correlation_id = message
            .correlation_id()
            .unwrap_or(message.message_id.as_str())
            .to_string();
        let dispatcher = Dispatcher::new(Arc::clone(&self.engine), correlation_id);

        match AssertUnwindSafe(handler.invoke(dispatcher, message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => DispatchResult::Handled,
            Ok(Err(e)) => DispatchResult::Failed(e),
            Err(panic) => DispatchResult::Failed(panic_message(panic).into()),
        }
    }

    async fn process(&self, message: Message) {
        // Buffered deliveries cannot be settled once the engine is stopping.
        if self.stopping.load(Ordering::SeqCst) {
            debug!(
                message_id = %message.message_id,
                "Host stopping, message left unsettled"
            );
            return;
        }

        debug!(
            message_id = %message.message_id,
            descriptor = %message.descriptor(),
            message_type = %message.message_type(),
            "Dispatching message"
        );

        match self.dispatch(message.clone()).await {
            DispatchResult::Handled => {
                if let Err(e) = self.engine.notify_success(&message).await {
                    warn!(message_id = %message.message_id, error = %e, "Failed to acknowledge message");
                }
            }
            DispatchResult::Unhandled => {
                warn!(
                    message_id = %message.message_id,
                    descriptor = %message.descriptor(),
                    "No handler registered, failing message"
                );
                self.fail(&message).await;
            }
            DispatchResult::Failed(handler_error) => {
                error!(
                    message_id = %message.message_id,
                    descriptor = %message.descriptor(),
                    retry_count = message.retry_count(),
                    error = %handler_error,
                    "Handler failed"
                );
                if let Err(e) = self
                    .error_policy
                    .handle_error(self.engine.as_ref(), &handler_error, message.clone())
                    .await
                {
                    error!(
                        message_id = %message.message_id,
                        error = %e,
                        "Error policy failed, failing message"
                    );
                    self.fail(&message).await;
                }
            }
        }
    }

    async fn fail(&self, message: &Message) {
        if let Err(e) = self.engine.notify_fail(message).await {
            warn!(message_id = %message.message_id, error = %e, "Failed to reject message");
        }
    }
}

fn rejected<T>(descriptor: MessageDescriptor) -> BusError {
    BusError::Subscribe(format!(
        "{} rejected for {}: descriptor already claimed by another type",
        std::any::type_name::<T>(),
        descriptor
    ))
}

// ============================================================================
// Host
// ============================================================================

/// Connects typed handlers to a bus engine.
pub struct BusHost {
    engine: Arc<dyn BusEngine>,
    error_policy: Arc<dyn ErrorPolicy>,
    concurrency_limit: Option<usize>,
    handlers: RwLock<HandlerTable>,
    dispatch_task: Mutex<Option<JoinHandle<()>>>,
    stopping: Arc<AtomicBool>,
}

impl BusHost {
    pub fn new(engine: Arc<dyn BusEngine>, error_policy: Arc<dyn ErrorPolicy>) -> Self {
        Self {
            engine,
            error_policy,
            concurrency_limit: None,
            handlers: RwLock::new(HandlerTable::default()),
            dispatch_task: Mutex::new(None),
            stopping: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Host that fails every message whose handler errors.
    pub fn without_retries(engine: Arc<dyn BusEngine>) -> Self {
        Self::new(engine, Arc::new(NoopErrorPolicy))
    }

    /// Build the error policy and concurrency limit from configuration.
    pub fn from_config(
        engine: Arc<dyn BusEngine>,
        config: &HostConfig,
    ) -> std::result::Result<Self, ConfigError> {
        let mut host = Self::new(engine, config.error_policy.build()?);
        host.concurrency_limit = config.concurrency_limit.filter(|limit| *limit > 0);
        Ok(host)
    }

    /// Maximum messages handled at once.
    pub fn with_concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = Some(limit).filter(|limit| *limit > 0);
        self
    }

    pub fn engine(&self) -> &Arc<dyn BusEngine> {
        &self.engine
    }

    /// Subscribe the engine to `T` and route `T` commands to `handler`.
    ///
    /// Registering a second handler for the same type replaces the first.
    /// Fails if the engine refuses `T`, e.g. because another command type
    /// already owns its descriptor.
    pub async fn subscribe_to_command<T, H>(&self, handler: H) -> Result<()>
    where
        T: Command,
        H: CommandHandler<T> + 'static,
    {
        let accepted = self.engine.subscribe_to_command::<T>().await?;
        let mut handlers = self.handlers.write().await;
        if !accepted && !handlers.commands.contains_key(&TypeId::of::<T>()) {
            return Err(rejected::<T>(T::descriptor()));
        }
        let previous = handlers
            .commands
            .insert(TypeId::of::<T>(), Arc::new(CommandHandlerAdapter::new(handler)));
        if previous.is_some() {
            warn!(descriptor = %T::descriptor(), "Replaced command handler");
        }
        debug!(descriptor = %T::descriptor(), "Command handler registered");
        Ok(())
    }

    /// Subscribe the engine to `T` and route `T` events to `handler`.
    ///
    /// Registering a second handler for the same type replaces the first.
    pub async fn subscribe_to_event<T, H>(&self, handler: H) -> Result<()>
    where
        T: Event,
        H: EventHandler<T> + 'static,
    {
        let accepted = self.engine.subscribe_to_event::<T>().await?;
        let mut handlers = self.handlers.write().await;
        if !accepted && !handlers.events.contains_key(&TypeId::of::<T>()) {
            return Err(rejected::<T>(T::descriptor()));
        }
        let previous = handlers
            .events
            .insert(TypeId::of::<T>(), Arc::new(EventHandlerAdapter::new(handler)));
        if previous.is_some() {
            warn!(descriptor = %T::descriptor(), "Replaced event handler");
        }
        debug!(descriptor = %T::descriptor(), "Event handler registered");
        Ok(())
    }

    pub async fn subscribe_to_command_fn<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Command,
        F: Fn(Dispatcher, CommandContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_to_command::<T, _>(DelegateCommandHandler::new(handler))
            .await
    }

    pub async fn subscribe_to_event_fn<T, F, Fut>(&self, handler: F) -> Result<()>
    where
        T: Event,
        F: Fn(Dispatcher, EventContext<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.subscribe_to_event::<T, _>(DelegateEventHandler::new(handler))
            .await
    }

    /// Start the engine and the dispatch loop.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.dispatch_task.lock().await;
        let stream = self.engine.start().await?;

        let dispatch = Arc::new(DispatchLoop {
            engine: Arc::clone(&self.engine),
            error_policy: Arc::clone(&self.error_policy),
            handlers: self.handlers.read().await.clone(),
            stopping: Arc::clone(&self.stopping),
        });
        let limit = self.concurrency_limit;

        info!(
            commands = dispatch.handlers.commands.len(),
            events = dispatch.handlers.events.len(),
            concurrency_limit = ?limit,
            "Bus host started"
        );

        *task = Some(tokio::spawn(async move {
            stream
                .for_each_concurrent(limit, |message| {
                    let dispatch = Arc::clone(&dispatch);
                    async move { dispatch.process(message).await }
                })
                .await;
            info!("Dispatch loop finished");
        }));

        Ok(())
    }

    /// Stop the engine, then wait for in-flight dispatches to finish.
    ///
    /// Messages still buffered in the stream are not dispatched; the broker
    /// redelivers them.
    pub async fn stop(&self) -> Result<()> {
        self.stopping.store(true, Ordering::SeqCst);
        self.engine.stop().await?;

        if let Some(task) = self.dispatch_task.lock().await.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Dispatch loop terminated abnormally");
            }
        }

        info!("Bus host stopped");
        Ok(())
    }

    /// Send a command under a new correlation id.
    pub async fn invoke_command<T: Command>(&self, command: T) -> Result<()> {
        Dispatcher::uncorrelated(Arc::clone(&self.engine))
            .invoke_command(command)
            .await
    }

    pub async fn invoke_command_with_correlation<T: Command>(
        &self,
        command: T,
        correlation_id: &str,
    ) -> Result<()> {
        Dispatcher::new(Arc::clone(&self.engine), correlation_id)
            .invoke_command(command)
            .await
    }

    /// Raise an event under a new correlation id.
    pub async fn raise_event<T: Event>(&self, event: T) -> Result<()> {
        Dispatcher::uncorrelated(Arc::clone(&self.engine))
            .raise_event(event)
            .await
    }

    pub async fn raise_event_with_correlation<T: Event>(
        &self,
        event: T,
        correlation_id: &str,
    ) -> Result<()> {
        Dispatcher::new(Arc::clone(&self.engine), correlation_id)
            .raise_event(event)
            .await
    }
}
