//! Host + in-memory engine loopback tests.
//!
//! Run with: cargo test --test in_memory_host

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchyard::config::Config;
use switchyard::host::{BusHost, HandlerError};
use switchyard::policy::{RetryErrorPolicy, RetryErrorPolicyOptions};
use switchyard::utils::bootstrap::{host_from_config, init_tracing};
use switchyard::{BusEngine, Command, Event, InMemoryBusEngine};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OpenAccount {
    owner: String,
}
impl Command for OpenAccount {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct AccountOpened {
    owner: String,
}
impl Event for AccountOpened {}

async fn wait_for(counter: &AtomicUsize, expected: usize) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if counter.load(Ordering::SeqCst) >= expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_command_handler_raises_event_back_through_bus() {
    init_tracing();
    let engine: Arc<dyn BusEngine> = Arc::new(InMemoryBusEngine::new());
    let host = BusHost::without_retries(engine);

    host.subscribe_to_command_fn::<OpenAccount, _, _>(|dispatcher, context| async move {
        dispatcher
            .raise_event(AccountOpened {
                owner: context.command().owner.clone(),
            })
            .await?;
        Ok::<(), HandlerError>(())
    })
    .await
    .unwrap();

    let (tx, mut rx) = mpsc::channel(4);
    host.subscribe_to_event_fn::<AccountOpened, _, _>(move |_dispatcher, context| {
        let tx = tx.clone();
        async move {
            let correlation_id = context.correlation_id().map(str::to_string);
            tx.send((context.event().clone(), correlation_id))
                .await
                .map_err(|e| -> HandlerError { e.to_string().into() })
        }
    })
    .await
    .unwrap();

    host.start().await.unwrap();
    host.invoke_command_with_correlation(
        OpenAccount {
            owner: "ada".to_string(),
        },
        "corr-loop",
    )
    .await
    .unwrap();

    let (event, correlation_id) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("Timed out waiting for event")
        .expect("Channel closed");
    assert_eq!(
        event,
        AccountOpened {
            owner: "ada".to_string()
        }
    );
    assert_eq!(correlation_id.as_deref(), Some("corr-loop"));

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_retry_policy_redelivers_through_engine() {
    let engine: Arc<dyn BusEngine> = Arc::new(InMemoryBusEngine::new());
    let policy = RetryErrorPolicy::new(RetryErrorPolicyOptions { max_retries: 3 }).unwrap();
    let host = BusHost::new(engine, Arc::new(policy));

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);
    host.subscribe_to_command_fn::<OpenAccount, _, _>(move |_dispatcher, context| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if context.retry_count() < 2 {
                return Err::<(), HandlerError>("not yet".into());
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    host.start().await.unwrap();
    host.invoke_command(OpenAccount {
        owner: "grace".to_string(),
    })
    .await
    .unwrap();

    assert!(wait_for(&attempts, 3).await);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    host.stop().await.unwrap();
}

#[tokio::test]
async fn test_unsubscribed_messages_are_dropped() {
    let engine: Arc<dyn BusEngine> = Arc::new(InMemoryBusEngine::new());
    let host = BusHost::without_retries(engine);

    let handled = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&handled);
    host.subscribe_to_event_fn::<AccountOpened, _, _>(move |_dispatcher, _context| {
        let counter = Arc::clone(&counter);
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<(), HandlerError>(())
        }
    })
    .await
    .unwrap();
    host.start().await.unwrap();

    host.invoke_command(OpenAccount {
        owner: "linus".to_string(),
    })
    .await
    .unwrap();
    host.raise_event(AccountOpened {
        owner: "linus".to_string(),
    })
    .await
    .unwrap();

    assert!(wait_for(&handled, 1).await);
    host.stop().await.unwrap();
    assert_eq!(handled.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_host_built_from_default_config() {
    let host = host_from_config(&Config::default()).unwrap();

    host.start().await.unwrap();
    host.raise_event(AccountOpened {
        owner: "nobody".to_string(),
    })
    .await
    .unwrap();
    host.stop().await.unwrap();
}
