//! RabbitMQ bus engine integration tests using testcontainers.
//!
//! Run with: cargo test --test bus_amqp --features amqp -- --ignored --nocapture
//!
//! These tests spin up RabbitMQ in a container using testcontainers-rs.
//! No manual RabbitMQ setup required.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard::bus::rabbitmq::{LapinConnectionFactory, RabbitMqOptions, StaticQueueFactory};
use switchyard::bus::{BusEngine, RabbitMqBusEngine};
use switchyard::host::{BusHost, HandlerError};
use switchyard::policy::{RetryErrorPolicy, RetryErrorPolicyOptions};
use switchyard::utils::bootstrap::init_tracing;
use switchyard::{Command, Event};
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};
use tokio::sync::mpsc;

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

/// Start RabbitMQ container.
///
/// Returns (container, amqp_url) where amqp_url is suitable for AMQP connection.
async fn start_rabbitmq() -> (testcontainers::ContainerAsync<GenericImage>, String) {
    let image = GenericImage::new("rabbitmq", "3-management")
        .with_exposed_port(5672.tcp())
        .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

    let container = image
        .with_startup_timeout(Duration::from_secs(60))
        .start()
        .await
        .expect("Failed to start rabbitmq container");

    // Brief delay to ensure RabbitMQ is fully ready
    tokio::time::sleep(Duration::from_secs(2)).await;

    let host_port = container
        .get_host_port_ipv4(5672)
        .await
        .expect("Failed to get mapped port");

    let host = container
        .get_host()
        .await
        .expect("Failed to get container host");

    let amqp_url = format!("amqp://guest:guest@{}:{}", host, host_port);

    println!("RabbitMQ available at: {}", amqp_url);

    (container, amqp_url)
}

fn engine(url: &str, options: RabbitMqOptions) -> Arc<dyn BusEngine> {
    let factory = LapinConnectionFactory::new(url).with_max_attempts(10);
    Arc::new(RabbitMqBusEngine::new(options, Arc::new(factory)))
}

fn unique(prefix: &str) -> String {
    format!("{}-{}", prefix, uuid::Uuid::new_v4())
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_command_round_trip() {
    init_tracing();
    let (_container, url) = start_rabbitmq().await;

    let consumer_options =
        RabbitMqOptions::default().with_command_queue(StaticQueueFactory::new(unique("commands")));
    let consumer = BusHost::without_retries(engine(&url, consumer_options));
    let (tx, mut rx) = mpsc::channel(10);
    consumer
        .subscribe_to_command_fn::<ReserveStock, _, _>(move |_dispatcher, context| {
            let tx = tx.clone();
            async move {
                let correlation_id = context.correlation_id().map(str::to_string);
                tx.send((context.command().clone(), correlation_id))
                    .await
                    .map_err(|e| -> HandlerError { e.to_string().into() })
            }
        })
        .await
        .expect("Failed to subscribe");
    consumer.start().await.expect("Failed to start consumer");

    let producer = BusHost::without_retries(engine(&url, RabbitMqOptions::default()));
    producer.start().await.expect("Failed to start producer");

    let command = ReserveStock {
        sku: "SKU-1".to_string(),
        quantity: 3,
    };
    producer
        .invoke_command_with_correlation(command.clone(), "corr-amqp")
        .await
        .expect("Failed to send");

    let (received, correlation_id) = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .expect("Timed out waiting for command")
        .expect("Channel closed");
    assert_eq!(received, command);
    assert_eq!(correlation_id.as_deref(), Some("corr-amqp"));

    producer.stop().await.expect("Failed to stop producer");
    consumer.stop().await.expect("Failed to stop consumer");
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_event_reaches_every_temporary_queue() {
    init_tracing();
    let (_container, url) = start_rabbitmq().await;

    let received = Arc::new(AtomicUsize::new(0));
    let mut hosts = Vec::new();
    for _ in 0..2 {
        let host = BusHost::without_retries(engine(&url, RabbitMqOptions::default()));
        let counter = Arc::clone(&received);
        host.subscribe_to_event_fn::<StockReserved, _, _>(move |_dispatcher, _context| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerError>(())
            }
        })
        .await
        .expect("Failed to subscribe");
        host.start().await.expect("Failed to start");
        hosts.push(host);
    }

    hosts[0]
        .raise_event(StockReserved {
            sku: "SKU-2".to_string(),
        })
        .await
        .expect("Failed to raise event");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while received.load(Ordering::SeqCst) < 2 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(received.load(Ordering::SeqCst), 2);

    for host in hosts {
        host.stop().await.expect("Failed to stop");
    }
}

#[tokio::test]
#[ignore = "Requires Docker"]
async fn test_retry_resends_until_ceiling_then_dead_letters() {
    init_tracing();
    let (_container, url) = start_rabbitmq().await;

    let options = RabbitMqOptions::default()
        .with_command_queue(StaticQueueFactory::new(unique("retry")))
        .with_dead_letter_exchange(unique("dead-letter"));
    let policy = RetryErrorPolicy::new(RetryErrorPolicyOptions { max_retries: 2 })
        .expect("Valid policy");
    let host = BusHost::new(engine(&url, options), Arc::new(policy));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    host.subscribe_to_command_fn::<ReserveStock, _, _>(move |_dispatcher, context| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<(), HandlerError>(format!("attempt {} failed", context.retry_count()).into())
        }
    })
    .await
    .expect("Failed to subscribe");
    host.start().await.expect("Failed to start");

    host.invoke_command(ReserveStock {
        sku: "SKU-3".to_string(),
        quantity: 1,
    })
    .await
    .expect("Failed to send");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while attempts.load(Ordering::SeqCst) < 3 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Give a requeue, if any, time to show up.
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    host.stop().await.expect("Failed to stop");
}
