use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use warren_core::{MessageContext, Publisher};
use warren_framework::{Batch, Dispatcher, SkipEmpty, on_routes};
use warren_runtime::{
    BatchConsumer, BatchConsumerConfig, ConsumerConfig, EngineState, RuntimeError, WarrenConfig,
    WarrenRuntime,
};
use warren_transport::MemoryBroker;

async fn on_order(ctx: Arc<MessageContext>) {
    ctx.ack();
}

fn config() -> WarrenConfig {
    WarrenConfig {
        consumers: vec![ConsumerConfig::new("orders")],
        batch_consumers: vec![
            BatchConsumerConfig::new("audit")
                .with_period(Duration::from_millis(20))
                .with_prefetch(10),
        ],
        ..Default::default()
    }
}

fn broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.bind("shop", "orders.#", "orders").unwrap();
    broker.bind("shop", "#", "audit").unwrap();
    broker
}

fn audit_route(tx: mpsc::UnboundedSender<usize>) -> warren_runtime::BatchRoute {
    // Declared with a long period; the configured entry replaces it.
    BatchConsumer::builder(BatchConsumerConfig::new("audit").with_period(Duration::from_secs(3600)))
        .filter(0, SkipEmpty)
        .handler(move |batch: Batch| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(batch.len());
            }
        })
}

#[tokio::test]
async fn test_runtime_drives_consumers_until_shutdown() {
    let broker = broker();
    let dispatcher = Dispatcher::builder()
        .route(on_routes(["orders.*"]).handler(on_order))
        .unwrap()
        .build();

    let (batches_tx, mut batches) = mpsc::unbounded_channel();
    let mut runtime = WarrenRuntime::from_config(&config())
        .with_channel_factory(Arc::new(broker.clone()))
        .with_dispatcher(dispatcher);
    runtime.register_batch_handler(audit_route(batches_tx)).unwrap();

    runtime.start().await.unwrap();
    runtime.start().await.unwrap();
    assert!(runtime.is_running().await);
    assert_eq!(
        runtime.batch_consumer_states().await,
        [("audit".to_string(), EngineState::Running)]
    );
    runtime.stop().await.unwrap();
    assert!(runtime.batch_consumer_states().await.is_empty());

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let publisher = broker.clone();
    let driver = tokio::spawn(async move {
        publisher.publish("shop", "orders.created", Bytes::new()).await.unwrap();
        publisher.publish("shop", "orders.paid", Bytes::new()).await.unwrap();
        let mut seen = 0;
        while seen < 2 {
            seen += batches.recv().await.unwrap();
        }
        while publisher.acked_count("orders") < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let _ = shutdown_tx.send(());
        seen
    });

    runtime
        .run_until(async {
            let _ = shutdown_rx.await;
        })
        .await
        .unwrap();

    assert_eq!(driver.await.unwrap(), 2);
    assert!(!runtime.is_running().await);
    assert_eq!(broker.acked_count("orders"), 2);
    assert_eq!(broker.acked_count("audit"), 2);
}

#[tokio::test]
async fn test_runtime_requires_channel_factory() {
    let runtime = WarrenRuntime::from_config(&WarrenConfig::default());
    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::MissingChannelFactory));
}

#[tokio::test]
async fn test_runtime_requires_dispatcher_for_consumers() {
    let runtime =
        WarrenRuntime::from_config(&config()).with_channel_factory(Arc::new(broker()));
    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::MissingDispatcher));
}

#[tokio::test]
async fn test_duplicate_batch_handler_rejected() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let mut runtime = WarrenRuntime::from_config(&config());
    runtime.register_batch_handler(audit_route(tx.clone())).unwrap();

    let err = runtime.register_batch_handler(audit_route(tx)).unwrap_err();
    assert!(matches!(err, RuntimeError::DuplicateBatchHandler(q) if q == "audit"));
}

#[tokio::test]
async fn test_failed_start_stops_started_consumers() {
    let broker = MemoryBroker::new();
    broker.declare_queue("orders");
    // "audit" is never declared, so its channel cannot be opened.

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut runtime = WarrenRuntime::from_config(&config())
        .with_channel_factory(Arc::new(broker.clone()))
        .with_dispatcher(Dispatcher::builder().build());
    runtime.register_batch_handler(audit_route(tx)).unwrap();

    let err = runtime.start().await.unwrap_err();
    assert!(matches!(err, RuntimeError::Engine { ref queue, .. } if queue == "audit"));
    assert!(!runtime.is_running().await);
    assert!(!broker.has_consumer("orders"));
}
