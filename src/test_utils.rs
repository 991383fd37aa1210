//! Test utilities shared by unit tests.

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};

use crate::bus::MessageStream;
use crate::message::{Command, Event, Message};

/// How long tests wait for something asynchronous to happen.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Sample command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipOrder {
    pub order_id: String,
    pub quantity: u32,
}

impl Command for ShipOrder {}

/// Sample event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    pub order_id: String,
}

impl Event for OrderShipped {}

pub fn ship_order(order_id: &str) -> ShipOrder {
    ShipOrder {
        order_id: order_id.to_string(),
        quantity: 1,
    }
}

pub fn order_shipped(order_id: &str) -> OrderShipped {
    OrderShipped {
        order_id: order_id.to_string(),
    }
}

/// Next message from the stream, or `None` on timeout or end of stream.
pub async fn next_message(stream: &mut MessageStream, timeout: Duration) -> Option<Message> {
    tokio::time::timeout(timeout, stream.next())
        .await
        .ok()
        .flatten()
}

/// Poll `condition` until it holds or `TEST_TIMEOUT` elapses.
pub async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
