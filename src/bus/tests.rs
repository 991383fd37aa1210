use super::*;
#[cfg(feature = "amqp")]
use crate::config::{QueueConfig, RabbitMqConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Ping;
impl Command for Ping {}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Pinged;
impl Event for Pinged {}

#[test]
fn test_state_guards() {
    assert!(EngineState::Created.ensure_created().is_ok());
    assert!(matches!(
        EngineState::Started.ensure_created(),
        Err(BusError::AlreadyStarted)
    ));
    assert!(matches!(
        EngineState::Stopped.ensure_created(),
        Err(BusError::Stopped)
    ));

    assert!(EngineState::Started.ensure_started().is_ok());
    assert!(matches!(
        EngineState::Created.ensure_started(),
        Err(BusError::NotStarted)
    ));
    assert!(matches!(
        EngineState::Stopped.ensure_started(),
        Err(BusError::Stopped)
    ));
}

#[tokio::test]
async fn test_send_routes_by_message_class() {
    let engine = MockBusEngine::new();
    engine.start().await.unwrap();

    engine.send(Message::command(Ping)).await.unwrap();
    engine.send(Message::event(Pinged)).await.unwrap();

    assert_eq!(engine.sent_commands().await.len(), 1);
    assert_eq!(engine.sent_events().await.len(), 1);
}

#[tokio::test]
async fn test_ext_helpers_register_typed_subscriptions() {
    let engine: Arc<dyn BusEngine> = Arc::new(InMemoryBusEngine::new());

    assert!(engine.subscribe_to_command::<Ping>().await.unwrap());
    assert!(!engine.subscribe_to_command::<Ping>().await.unwrap());
    assert!(engine.subscribe_to_event::<Pinged>().await.unwrap());
}

#[test]
fn test_init_in_memory_engine() {
    let config = EngineConfig::default();
    assert!(init_bus_engine(&config).is_ok());
}

#[cfg(feature = "amqp")]
#[test]
fn test_init_rabbitmq_engine_validates_encoding() {
    let config = EngineConfig {
        engine_type: EngineType::RabbitMq,
        rabbitmq: RabbitMqConfig {
            outbound_encoding: "not-an-encoding".to_string(),
            ..Default::default()
        },
    };

    let result = init_bus_engine(&config);

    assert!(matches!(
        result,
        Err(BusError::Config(ConfigError::InvalidEncoding(_)))
    ));
}

#[cfg(feature = "amqp")]
#[test]
fn test_init_rabbitmq_engine_rejects_decode_only_encoding() {
    let config = EngineConfig {
        engine_type: EngineType::RabbitMq,
        rabbitmq: RabbitMqConfig {
            outbound_encoding: "utf-16".to_string(),
            ..Default::default()
        },
    };

    let result = init_bus_engine(&config);

    assert!(matches!(
        result,
        Err(BusError::Config(ConfigError::InvalidEncoding(label))) if label == "utf-16"
    ));
}

#[cfg(feature = "amqp")]
#[test]
fn test_init_rabbitmq_engine_does_not_connect() {
    let config = EngineConfig {
        engine_type: EngineType::RabbitMq,
        rabbitmq: RabbitMqConfig {
            url: "amqp://unreachable.invalid:5672".to_string(),
            command_queue: QueueConfig::Static {
                queue_name: "commands".to_string(),
            },
            ..Default::default()
        },
    };

    assert!(init_bus_engine(&config).is_ok());
}

#[test]
fn test_json_error_maps_to_serialization() {
    let err = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
    let bus_error: BusError = err.into();
    assert!(matches!(bus_error, BusError::Serialization(_)));
}
