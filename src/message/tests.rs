use super::*;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ReserveStock {
    sku: String,
    quantity: u32,
}
impl Command for ReserveStock {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StockReserved {
    sku: String,
}
impl Event for StockReserved {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Renamed;
impl Command for Renamed {
    fn descriptor() -> MessageDescriptor {
        MessageDescriptor::new("Warehouse", "ReserveStockV2")
    }
}

fn reserve() -> ReserveStock {
    ReserveStock {
        sku: "sku-1".to_string(),
        quantity: 3,
    }
}

#[test]
fn test_command_message_erases_to_envelope() {
    let mut typed = CommandMessage::with_id("msg-1", reserve());
    typed.headers.set_user("tenant", "acme");

    let message: Message = typed.into();

    assert_eq!(message.message_id, "msg-1");
    assert!(message.is_command());
    assert_eq!(message.payload_type(), TypeId::of::<ReserveStock>());
    assert_eq!(message.descriptor(), &ReserveStock::descriptor());
    assert_eq!(message.headers.user("tenant"), Some("acme"));
    assert_eq!(message.payload::<ReserveStock>(), Some(&reserve()));
}

#[test]
fn test_typed_view_round_trip() {
    let message = Message::command(reserve());
    let id = message.message_id.clone();

    let typed = CommandMessage::<ReserveStock>::try_from(message).unwrap();

    assert_eq!(typed.message_id, id);
    assert_eq!(*typed.command, reserve());
}

#[test]
fn test_typed_view_rejects_wrong_type() {
    let message = Message::event(StockReserved {
        sku: "sku-1".to_string(),
    });

    let as_command = CommandMessage::<ReserveStock>::try_from(message.clone());
    assert!(as_command.is_err());

    let as_other_event = EventMessage::<StockReserved>::try_from(message);
    assert!(as_other_event.is_ok());
}

#[test]
fn test_payload_downcast_to_wrong_type_is_none() {
    let message = Message::command(reserve());

    assert!(message.payload::<StockReserved>().is_none());
    assert!(message.payload_arc::<StockReserved>().is_none());
    assert!(message.payload_arc::<ReserveStock>().is_some());
}

#[test]
fn test_payload_value_uses_serde() {
    let message = Message::command(reserve());

    let value = message.payload_value().unwrap();

    assert_eq!(value["sku"], "sku-1");
    assert_eq!(value["quantity"], 3);
}

#[test]
fn test_descriptor_override_is_used_by_envelope() {
    let message = Message::command(Renamed);

    assert_eq!(message.descriptor().to_string(), "Warehouse:ReserveStockV2");
}

#[test]
fn test_fresh_messages_get_distinct_ids() {
    let a = Message::command(reserve());
    let b = Message::command(reserve());

    assert_ne!(a.message_id, b.message_id);
    assert!(Uuid::parse_str(&a.message_id).is_ok());
}
