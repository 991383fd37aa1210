//! Header mapping between `HeaderBag` and AMQP headers.
//!
//! On the wire every header carries a prefix naming its namespace:
//!
//! | Namespace | Wire key                    | Bag key                  |
//! |-----------|-----------------------------|--------------------------|
//! | control   | `Switchyard:CorrelationId`  | `CorrelationId`          |
//! | transport | `RabbitMq:DeliveryTag`      | `RabbitMq:DeliveryTag`   |
//! | transport | `Transport:Kafka:Offset`    | `Kafka:Offset`           |
//! | user      | `Custom:tenant`             | `tenant`                 |
//!
//! Headers of other transports carry the transport name after the
//! `Transport:` prefix.
//!
//! `Switchyard:MessageId` and `Switchyard:MessageType` are envelope fields, not
//! bag entries. The delivery tag is inbound only and never re-sent.

use std::collections::BTreeMap;

use crate::message::headers::TRANSPORT_SEPARATOR;
use crate::message::{ControlHeader, HeaderBag, Message};

use super::transport::WireValue;

/// Prefix of control headers on the wire.
pub const CONTROL_PREFIX: &str = "Switchyard:";
/// Transport name used for RabbitMQ-specific headers.
pub const TRANSPORT_NAME: &str = "RabbitMq";
/// Prefix of headers belonging to transports other than this one.
pub const FOREIGN_TRANSPORT_PREFIX: &str = "Transport:";
/// Prefix of user headers on the wire.
pub const USER_PREFIX: &str = "Custom:";

pub const MESSAGE_ID_HEADER: &str = "Switchyard:MessageId";
pub const MESSAGE_TYPE_HEADER: &str = "Switchyard:MessageType";
pub const DELIVERY_TAG_KEY: &str = "DeliveryTag";

/// Headers of one delivery, split into envelope fields and the bag.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundHeaders {
    pub message_id: Option<String>,
    pub message_type: Option<String>,
    pub headers: HeaderBag,
}

/// Map wire headers into a bag, recording the actual delivery tag.
///
/// An inbound `RabbitMq:DeliveryTag` header is ignored: only the tag the
/// broker assigned to this delivery can be acknowledged.
pub fn decode_headers(wire: &BTreeMap<String, WireValue>, delivery_tag: u64) -> InboundHeaders {
    let mut inbound = InboundHeaders::default();
    let transport_prefix = format!("{}:", TRANSPORT_NAME);

    for (key, value) in wire {
        let text = value.to_text();

        if key == MESSAGE_ID_HEADER {
            inbound.message_id = Some(text);
        } else if key == MESSAGE_TYPE_HEADER {
            inbound.message_type = Some(text);
        } else if let Some(name) = key.strip_prefix(CONTROL_PREFIX) {
            match name.parse::<ControlHeader>() {
                Ok(header) => inbound.headers.set_control(header, text),
                Err(()) => inbound.headers.set_user(key.clone(), text),
            }
        } else if let Some(name) = key.strip_prefix(transport_prefix.as_str()) {
            if name != DELIVERY_TAG_KEY {
                inbound.headers.set_transport(TRANSPORT_NAME, name, text);
            }
        } else if let Some(rest) = key.strip_prefix(FOREIGN_TRANSPORT_PREFIX) {
            match rest.split_once(TRANSPORT_SEPARATOR) {
                Some((transport, name)) if !transport.is_empty() && !name.is_empty() => {
                    if transport != TRANSPORT_NAME || name != DELIVERY_TAG_KEY {
                        inbound.headers.set_transport(transport, name, text);
                    }
                }
                _ => inbound.headers.set_user(key.clone(), text),
            }
        } else if let Some(name) = key.strip_prefix(USER_PREFIX) {
            inbound.headers.set_user(name, text);
        } else {
            inbound.headers.set_user(key.clone(), text);
        }
    }

    inbound
        .headers
        .set_transport(TRANSPORT_NAME, DELIVERY_TAG_KEY, delivery_tag.to_string());
    inbound
}

/// Map an envelope's identity and bag onto wire headers.
pub fn encode_headers(message: &Message) -> BTreeMap<String, WireValue> {
    let mut wire = BTreeMap::new();

    wire.insert(
        MESSAGE_ID_HEADER.to_string(),
        WireValue::from(message.message_id.as_str()),
    );
    wire.insert(
        MESSAGE_TYPE_HEADER.to_string(),
        WireValue::from(message.descriptor().to_string()),
    );

    for (header, value) in message.headers.control_headers() {
        wire.insert(format!("{}{}", CONTROL_PREFIX, header), WireValue::from(value));
    }

    for (key, value) in message.headers.transport_headers() {
        let wire_key = if key.transport == TRANSPORT_NAME {
            if key.key == DELIVERY_TAG_KEY {
                continue;
            }
            key.to_string()
        } else {
            format!("{}{}", FOREIGN_TRANSPORT_PREFIX, key)
        };
        wire.insert(wire_key, WireValue::from(value));
    }

    for (key, value) in message.headers.user_headers() {
        wire.insert(format!("{}{}", USER_PREFIX, key), WireValue::from(value));
    }

    wire
}

/// Delivery tag recorded on an inbound message, if any.
pub fn delivery_tag(headers: &HeaderBag) -> Option<u64> {
    headers
        .transport(TRANSPORT_NAME, DELIVERY_TAG_KEY)
        .and_then(|tag| tag.trim().parse().ok())
}
