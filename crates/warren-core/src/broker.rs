//! Broker capabilities consumed by the dispatch layer.
//!
//! Warren never talks to the network itself. Connection management, channel
//! creation and publishing are supplied by a collaborator through the traits
//! in this module:
//!
//! | Trait | Capability |
//! |---|---|
//! | [`ChannelFactory`] | open a consuming channel on a queue with a prefetch |
//! | [`ConsumingChannel`] | start consuming, acknowledge by tag, close |
//! | [`Publisher`] | publish a payload to an exchange with a routing key |
//!
//! ```text
//! Broker ──▶ DeliveryCallback ──▶ Consumer / BatchConsumer ──▶ pipelines
//!   ▲                                     │
//!   └────────── acknowledge(tag) ◀────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::delivery::{AckOutcome, Delivery};
use crate::error::BrokerResult;

/// Callback invoked by the broker for every delivery on a consuming channel.
///
/// Runs on the broker's delivery task, so implementations must return quickly
/// and must not block.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Opens consuming channels.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    /// Opens a channel bound to `queue` with the given prefetch count applied.
    async fn open_consuming_channel(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> BrokerResult<Arc<dyn ConsumingChannel>>;
}

/// An open channel consuming from a single queue.
#[async_trait]
pub trait ConsumingChannel: Send + Sync {
    /// Name of the queue this channel consumes.
    fn queue(&self) -> &str;

    /// Starts delivering messages to `on_delivery`.
    async fn consume(&self, on_delivery: DeliveryCallback) -> BrokerResult<()>;

    /// Acknowledges or rejects a delivery by tag.
    async fn acknowledge(&self, delivery_tag: u64, outcome: AckOutcome) -> BrokerResult<()>;

    /// Stops consuming and closes the channel.
    ///
    /// Unacknowledged deliveries are returned to the queue by the broker.
    async fn close(&self) -> BrokerResult<()>;
}

/// Publishes messages.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` to `exchange` with `routing_key`.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> BrokerResult<()>;
}

/// Shared channel factory.
pub type BoxedChannelFactory = Arc<dyn ChannelFactory>;

/// Shared publisher.
pub type BoxedPublisher = Arc<dyn Publisher>;
