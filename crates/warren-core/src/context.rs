//! Per-delivery message handling context.
//!
//! A [`MessageContext`] is created for every (delivery, matched handler) pair
//! and threaded through that handler's middleware pipeline as
//! `Arc<MessageContext>`. It carries:
//!
//! - the delivery itself (payload, routing key, exchange, tag),
//! - the pending [`AckDecision`], which middleware and handlers mutate,
//! - an isolated, type-keyed state bag used by middlewares to pass data to
//!   later middlewares or to the handler,
//! - an optional [`Publisher`](crate::Publisher) for handlers that publish
//!   follow-up messages.
//!
//! The context is discarded once the pipeline finishes and its final decision
//! has been read.
//!
//! ```rust,ignore
//! async fn handle(ctx: Arc<MessageContext>) -> Result<(), BoxError> {
//!     let order: Order = ctx.json()?;
//!     ctx.set_state(order.id);
//!     ctx.ack();
//!     Ok(())
//! }
//! ```

use std::any::{Any, TypeId};
use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;

use crate::broker::BoxedPublisher;
use crate::delivery::{AckDecision, Delivery};
use crate::error::{BrokerError, BrokerResult};

/// The context handed to middlewares and handlers for one delivery.
pub struct MessageContext {
    delivery: Delivery,
    decision: Mutex<AckDecision>,
    state: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    publisher: Option<BoxedPublisher>,
}

impl MessageContext {
    /// Creates a fresh context with a pending decision and empty state.
    pub fn new(delivery: Delivery) -> Self {
        Self {
            delivery,
            decision: Mutex::new(AckDecision::Pending),
            state: Mutex::new(HashMap::new()),
            publisher: None,
        }
    }

    /// Attaches a publisher that handlers can use for follow-up messages.
    pub fn with_publisher(mut self, publisher: BoxedPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    // ─── Delivery accessors ──────────────────────────────────────────────────

    /// Returns the underlying delivery.
    pub fn delivery(&self) -> &Delivery {
        &self.delivery
    }

    /// Returns the raw payload.
    pub fn payload(&self) -> &Bytes {
        &self.delivery.payload
    }

    /// Returns the routing key.
    pub fn routing_key(&self) -> &str {
        &self.delivery.routing_key
    }

    /// Returns the exchange the message arrived through.
    pub fn exchange(&self) -> &str {
        &self.delivery.exchange
    }

    /// Returns the delivery tag.
    pub fn delivery_tag(&self) -> u64 {
        self.delivery.delivery_tag
    }

    /// Returns `true` if the broker delivered this message before.
    pub fn is_redelivered(&self) -> bool {
        self.delivery.redelivered
    }

    /// Interprets the payload as UTF-8 text.
    pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.delivery.payload)
    }

    /// Deserializes the payload as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.delivery.payload)
    }

    // ─── Acknowledgment decision ─────────────────────────────────────────────

    /// Returns the current decision.
    pub fn decision(&self) -> AckDecision {
        *self.decision.lock()
    }

    /// Overwrites the decision.
    pub fn set_decision(&self, decision: AckDecision) {
        *self.decision.lock() = decision;
    }

    /// Decides to acknowledge the delivery.
    pub fn ack(&self) {
        self.set_decision(AckDecision::Ack);
    }

    /// Decides to reject the delivery without requeue.
    pub fn nack(&self) {
        self.set_decision(AckDecision::Nack);
    }

    /// Decides to reject the delivery and have it redelivered.
    pub fn requeue(&self) {
        self.set_decision(AckDecision::Requeue);
    }

    // ─── Side-channel state ──────────────────────────────────────────────────

    /// Stores a value in the state bag. One value per type; later calls overwrite.
    pub fn set_state<T: Send + Sync + 'static>(&self, value: T) {
        self.state.lock().insert(TypeId::of::<T>(), Box::new(value));
    }

    /// Retrieves a cloned value from the state bag.
    pub fn get_state<T: Clone + 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Returns `true` if a value of type `T` is stored.
    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.lock().contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns a value from the state bag.
    pub fn take_state<T: 'static>(&self) -> Option<T> {
        self.state
            .lock()
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    // ─── Publishing ──────────────────────────────────────────────────────────

    /// Returns the attached publisher, if any.
    pub fn publisher(&self) -> Option<&BoxedPublisher> {
        self.publisher.as_ref()
    }

    /// Publishes a follow-up message through the attached publisher.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: impl Into<Bytes>,
    ) -> BrokerResult<()> {
        let Some(publisher) = &self.publisher else {
            return Err(BrokerError::Publish {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                reason: "no publisher attached to this context".to_string(),
            });
        };
        publisher
            .publish(exchange, routing_key, payload.into())
            .await
    }
}

impl std::fmt::Debug for MessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("delivery", &self.delivery)
            .field("decision", &self.decision())
            .field("has_publisher", &self.publisher.is_some())
            .finish_non_exhaustive()
    }
}
