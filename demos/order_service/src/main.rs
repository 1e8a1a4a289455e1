//! Order Service Demo
//!
//! Wires an in-memory broker to a dispatcher and a batch consumer:
//!
//! ```text
//! exchange "shop"
//!   orders.#   ──▶ queue "orders" ──▶ Consumer ──▶ Dispatcher
//!   #          ──▶ queue "audit"  ──▶ BatchConsumer (every 500 ms)
//! ```
//!
//! Handlers:
//! - `orders.*.created` stores the order and publishes `orders.<region>.confirmed`
//! - `orders.*.cancelled` fails for unknown orders; the error chain requeues
//!   once, then rejects the delivery
//! - `orders.#` logs every order event (runs last)
//!
//! # Usage
//!
//! ```bash
//! cargo run --package order-service
//! WARREN_LOGGING__LEVEL=debug cargo run --package order-service
//! ```

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use warren::prelude::*;
use warren::runtime::ConfigLoader;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: u64,
    region: String,
    total_cents: u64,
}

static KNOWN_ORDERS: Mutex<Option<HashSet<u64>>> = Mutex::new(None);

fn remember(id: u64) {
    if let Ok(mut known) = KNOWN_ORDERS.lock() {
        known.get_or_insert_with(HashSet::new).insert(id);
    }
}

fn is_known(id: u64) -> bool {
    KNOWN_ORDERS
        .lock()
        .map(|known| known.as_ref().is_some_and(|k| k.contains(&id)))
        .unwrap_or(false)
}

// ============================================================================
// Handlers
// ============================================================================

async fn on_created(
    Json(order): Json<Order>,
    PublisherHandle(publisher): PublisherHandle,
) -> Result<(), BoxError> {
    info!(order = order.id, region = %order.region, total_cents = order.total_cents, "Order created");
    remember(order.id);

    let key = format!("orders.{}.confirmed", order.region);
    publisher
        .publish("shop", &key, Bytes::from(serde_json::to_vec(&order)?))
        .await?;
    Ok(())
}

async fn on_cancelled(Json(order): Json<Order>, Redelivered(redelivered): Redelivered) -> Result<(), BoxError> {
    if !is_known(order.id) {
        return Err(format!("unknown order {} (redelivered: {redelivered})", order.id).into());
    }
    info!(order = order.id, "Order cancelled");
    Ok(())
}

async fn audit_log(RoutingKey(key): RoutingKey, DeliveryTag(tag): DeliveryTag) {
    info!(%key, tag, "Order event");
}

async fn store_audit(batch: Batch) -> Result<(), BoxError> {
    for delivery in batch.deliveries() {
        if batch.is_cancelled() {
            warn!("Stopping audit batch early");
            batch.requeue();
            return Ok(());
        }
        info!(key = %delivery.routing_key, bytes = delivery.payload.len(), "Audit");
    }
    Ok(())
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let config = ConfigLoader::new()
        .merge(WarrenConfig {
            consumers: vec![ConsumerConfig::new("orders").with_prefetch(16)],
            batch_consumers: vec![
                BatchConsumerConfig::new("audit")
                    .with_period(Duration::from_millis(500))
                    .with_prefetch(100),
            ],
            ..Default::default()
        })
        .load()?;

    let broker = MemoryBroker::new();
    broker.bind("shop", "orders.#", "orders")?;
    broker.bind("shop", "#", "audit")?;

    let dispatcher = Dispatcher::builder()
        .route(on_routes(["orders.*.created"]).exchange("shop").handler(on_created))?
        .route(on_routes(["orders.*.cancelled"]).exchange("shop").handler(on_cancelled))?
        .route(on_routes(["orders.#"]).order(100).handler(audit_log))?
        .middleware(0, Tracing)
        .middleware(10, AutoAck::new())
        .error_middleware(0, middleware_fn(|failure: Failure, next: Next<Failure>| async move {
            if failure.ctx.is_redelivered() {
                failure.ctx.nack();
            } else {
                failure.ctx.requeue();
            }
            next.run(failure).await
        }))
        .error_middleware(10, LogErrors::new())
        .publisher(Arc::new(broker.clone()))
        .build();

    let mut runtime = WarrenRuntime::from_config(&config)
        .with_channel_factory(Arc::new(broker.clone()))
        .with_dispatcher(dispatcher);
    runtime.register_batch_handler(
        BatchConsumer::builder(BatchConsumerConfig::new("audit"))
            .filter(0, DedupFilter)
            .filter(10, SkipEmpty)
            .handler(store_audit),
    )?;

    let orders = [
        ("orders.eu.created", Order { id: 1, region: "eu".into(), total_cents: 4_200 }),
        ("orders.us.created", Order { id: 2, region: "us".into(), total_cents: 1_999 }),
        ("orders.eu.cancelled", Order { id: 1, region: "eu".into(), total_cents: 4_200 }),
        ("orders.us.cancelled", Order { id: 7, region: "us".into(), total_cents: 500 }),
    ];
    let publisher = broker.clone();
    tokio::spawn(async move {
        for (key, order) in orders {
            match serde_json::to_vec(&order) {
                Ok(body) => {
                    if let Err(e) = publisher.publish("shop", key, Bytes::from(body)).await {
                        warn!(error = %e, "Publish failed");
                    }
                }
                Err(e) => warn!(error = %e, "Failed to encode order"),
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    });

    runtime
        .run_until(tokio::time::sleep(Duration::from_secs(2)))
        .await?;

    info!(
        acked = broker.acked_count("orders"),
        rejected = broker.rejected_count("orders"),
        audited = broker.acked_count("audit"),
        "Demo finished"
    );
    Ok(())
}
