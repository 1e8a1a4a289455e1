use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use warren_core::{MessageContext, Publisher};
use warren_framework::{BoxError, Dispatcher, RoutingKey, Text, on_routes};
use warren_runtime::{Consumer, ConsumerConfig, EngineState};
use warren_transport::MemoryBroker;

/// Polls `condition` until it holds or a second has passed.
async fn eventually(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn on_order(ctx: Arc<MessageContext>) {
    ctx.ack();
}

async fn on_payment(ctx: Arc<MessageContext>) -> Result<(), BoxError> {
    ctx.nack();
    Err("card declined".into())
}

async fn on_retry(ctx: Arc<MessageContext>) -> Result<(), BoxError> {
    if ctx.is_redelivered() {
        ctx.ack();
        Ok(())
    } else {
        ctx.requeue();
        Err("try again".into())
    }
}

fn broker() -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker.bind("shop", "#", "orders").unwrap();
    broker
}

#[tokio::test]
async fn test_consumer_applies_dispatch_decisions() {
    let broker = broker();
    let dispatcher = Dispatcher::builder()
        .route(on_routes(["orders.*"]).handler(on_order))
        .unwrap()
        .route(on_routes(["payments.#"]).handler(on_payment))
        .unwrap()
        .build();

    let consumer = Consumer::new(
        ConsumerConfig::new("orders"),
        Arc::new(dispatcher),
        Arc::new(broker.clone()),
    );
    consumer.start().await.unwrap();
    assert_eq!(consumer.state(), EngineState::Running);

    broker.publish("shop", "orders.created", Bytes::new()).await.unwrap();
    broker.publish("shop", "payments.card.failed", Bytes::new()).await.unwrap();
    broker.publish("shop", "inventory.low", Bytes::new()).await.unwrap();

    eventually(|| broker.acked_count("orders") == 1 && broker.rejected_count("orders") == 1).await;

    // Nothing matched, so the decision stays pending.
    assert_eq!(broker.unacked_len("orders"), 1);

    consumer.stop().await.unwrap();
    assert_eq!(broker.queue_len("orders"), 1);
}

#[tokio::test]
async fn test_requeued_delivery_comes_back_redelivered() {
    let broker = broker();
    let dispatcher = Dispatcher::builder()
        .route(on_routes(["jobs.#"]).handler(on_retry))
        .unwrap()
        .build();

    let consumer = Consumer::new(
        ConsumerConfig::new("orders").with_prefetch(1),
        Arc::new(dispatcher),
        Arc::new(broker.clone()),
    );
    consumer.start().await.unwrap();
    broker.publish("shop", "jobs.resize", Bytes::new()).await.unwrap();

    eventually(|| broker.acked_count("orders") == 1).await;
    assert_eq!(broker.rejected_count("orders"), 0);
    consumer.dispose().await.unwrap();
}

#[tokio::test]
async fn test_deliveries_dispatched_in_arrival_order() {
    let broker = broker();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    let dispatcher = Dispatcher::builder()
        .route(
            on_routes(["#"])
                .named("recorder")
                .handler(move |RoutingKey(key): RoutingKey, Text(body): Text, ctx: Arc<MessageContext>| {
                    let sink = Arc::clone(&sink);
                    async move {
                        sink.lock().push(format!("{key}:{body}"));
                        ctx.ack();
                    }
                }),
        )
        .unwrap()
        .build();

    let consumer = Consumer::new(
        ConsumerConfig::new("orders"),
        Arc::new(dispatcher),
        Arc::new(broker.clone()),
    );
    consumer.start().await.unwrap();

    for (key, body) in [("a", "1"), ("b", "2"), ("c", "3")] {
        broker
            .publish("shop", key, Bytes::from_static(body.as_bytes()))
            .await
            .unwrap();
    }

    eventually(|| broker.acked_count("orders") == 3).await;
    assert_eq!(*seen.lock(), ["a:1", "b:2", "c:3"]);
    consumer.stop().await.unwrap();
}

#[tokio::test]
async fn test_consumer_lifecycle() {
    let broker = broker();
    let consumer = Consumer::new(
        ConsumerConfig::new("orders").with_prefetch(0),
        Arc::new(Dispatcher::builder().build()),
        Arc::new(broker.clone()),
    );

    assert!(consumer.start().await.is_err());
    assert_eq!(broker.opened_channels(), 0);

    let consumer = Consumer::new(
        ConsumerConfig::new("orders"),
        Arc::new(Dispatcher::builder().build()),
        Arc::new(broker.clone()),
    );
    consumer.start().await.unwrap();
    consumer.start().await.unwrap();
    assert_eq!(broker.opened_channels(), 1);
    assert!(broker.has_consumer("orders"));

    consumer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    assert!(!broker.has_consumer("orders"));

    consumer.dispose().await.unwrap();
    consumer.dispose().await.unwrap();
    assert_eq!(consumer.state(), EngineState::Disposed);
    assert!(consumer.start().await.is_err());
}

#[tokio::test]
async fn test_panicking_handler_does_not_stop_consumer() {
    let broker = broker();
    let dispatcher = Dispatcher::builder()
        .route(on_routes(["orders.*"]).handler(on_order))
        .unwrap()
        .route(on_routes(["poison"]).handler(|RoutingKey(key): RoutingKey| async move {
            assert_ne!(key, "poison", "cannot handle poison");
        }))
        .unwrap()
        .build();

    let consumer = Consumer::new(
        ConsumerConfig::new("orders"),
        Arc::new(dispatcher),
        Arc::new(broker.clone()),
    );
    consumer.start().await.unwrap();

    broker.publish("shop", "poison", Bytes::new()).await.unwrap();
    broker.publish("shop", "orders.created", Bytes::new()).await.unwrap();
    broker.publish("shop", "orders.paid", Bytes::new()).await.unwrap();

    eventually(|| broker.acked_count("orders") == 2).await;
    assert_eq!(consumer.state(), EngineState::Running);
    assert_eq!(broker.unacked_len("orders"), 1);

    consumer.stop().await.unwrap();
    assert!(!broker.has_consumer("orders"));
    assert_eq!(broker.queue_len("orders"), 1);
}
