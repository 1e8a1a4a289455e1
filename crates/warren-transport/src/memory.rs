//! In-memory broker.
//!
//! [`MemoryBroker`] keeps queues, topic bindings and consumer state in process
//! memory. Deliveries are pushed to the consumer callback synchronously from
//! whichever call made them available (publish, ack, requeue, consume).
//!
//! Semantics follow a topic exchange:
//!
//! - `publish` routes a message to every queue bound to the exchange with a
//!   matching pattern; a queue receives at most one copy
//! - publishing to the empty exchange name routes to the queue named by the
//!   routing key
//! - unroutable messages are dropped
//! - each queue has at most one consumer; at most `prefetch` deliveries are
//!   unacknowledged at a time (0 means unlimited)
//! - requeued and returned deliveries go back to the head of the queue with
//!   `redelivered = true`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;
use warren_core::{
    AckOutcome, BrokerError, BrokerResult, ChannelFactory, ConsumingChannel, Delivery,
    DeliveryCallback, PatternError, Publisher, RoutePattern,
};

/// A queued message awaiting delivery.
#[derive(Debug, Clone)]
struct Message {
    exchange: String,
    routing_key: String,
    payload: Bytes,
    redelivered: bool,
}

struct Binding {
    exchange: String,
    pattern: RoutePattern,
    queue: String,
}

struct ConsumerSlot {
    channel_id: u64,
    consumer_tag: String,
    prefetch: u16,
    callback: DeliveryCallback,
    unacked: HashMap<u64, Message>,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    consumer: Option<ConsumerSlot>,
    acked: u64,
    rejected: u64,
}

impl QueueState {
    /// Returns unacknowledged deliveries to the head of the queue, oldest first.
    fn return_unacked(&mut self, unacked: HashMap<u64, Message>) {
        let mut returned: Vec<_> = unacked.into_iter().collect();
        returned.sort_by_key(|(tag, _)| *tag);
        for (_, mut message) in returned.into_iter().rev() {
            message.redelivered = true;
            self.ready.push_front(message);
        }
    }
}

#[derive(Default)]
struct State {
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    next_tag: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    // Serializes delivery so callbacks observe queue order.
    delivery: Mutex<()>,
    next_channel: AtomicU64,
    opened_channels: AtomicU64,
}

/// An in-process topic broker.
///
/// Cheap to clone; clones share the same queues.
///
/// ```rust,ignore
/// let broker = MemoryBroker::new();
/// broker.bind("shop", "orders.#", "orders")?;
/// broker.publish("shop", "orders.created", Bytes::from_static(b"{}")).await?;
/// assert_eq!(broker.queue_len("orders"), 1);
/// ```
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a queue. Declaring an existing queue is a no-op.
    pub fn declare_queue(&self, queue: impl Into<String>) {
        self.inner.state.lock().queues.entry(queue.into()).or_default();
    }

    /// Binds `queue` to `exchange` for routing keys matching `pattern`,
    /// declaring the queue if needed.
    ///
    /// # Errors
    ///
    /// Fails if `pattern` does not parse.
    pub fn bind(
        &self,
        exchange: impl Into<String>,
        pattern: &str,
        queue: impl Into<String>,
    ) -> Result<(), PatternError> {
        let pattern = RoutePattern::new(pattern)?;
        let exchange = exchange.into();
        let queue = queue.into();

        let mut state = self.inner.state.lock();
        state.queues.entry(queue.clone()).or_default();
        if !state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.queue == queue && b.pattern == pattern)
        {
            debug!(%exchange, %pattern, %queue, "Queue bound");
            state.bindings.push(Binding {
                exchange,
                pattern,
                queue,
            });
        }
        Ok(())
    }

    // ─── Inspection ──────────────────────────────────────────────────────────

    /// Number of messages waiting for delivery.
    pub fn queue_len(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len())
    }

    /// Number of delivered but unacknowledged messages.
    pub fn unacked_len(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.consumer.as_ref().map_or(0, |c| c.unacked.len()))
    }

    /// Number of positively acknowledged messages.
    pub fn acked_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.acked)
    }

    /// Number of messages rejected without requeue.
    pub fn rejected_count(&self, queue: &str) -> u64 {
        self.with_queue(queue, |q| q.rejected)
    }

    /// Returns `true` if a consumer is attached to `queue`.
    pub fn has_consumer(&self, queue: &str) -> bool {
        self.with_queue(queue, |q| q.consumer.is_some())
    }

    /// Number of consuming channels opened so far.
    pub fn opened_channels(&self) -> u64 {
        self.inner.opened_channels.load(Ordering::SeqCst)
    }

    fn with_queue<T: Default>(&self, queue: &str, f: impl FnOnce(&QueueState) -> T) -> T {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map(f)
            .unwrap_or_default()
    }

    // ─── Delivery ────────────────────────────────────────────────────────────

    fn enqueue(&self, queues: &[String], message: &Message) {
        let mut state = self.inner.state.lock();
        for queue in queues {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(message.clone());
            }
        }
    }

    /// Pushes ready messages to the queue's consumer while its prefetch window
    /// has room.
    fn pump(&self, queue: &str) {
        let _delivering = self.inner.delivery.lock();

        let outbox = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;
            let Some(q) = state.queues.get_mut(queue) else {
                return;
            };
            let Some(consumer) = q.consumer.as_mut() else {
                return;
            };

            let mut outbox = Vec::new();
            while consumer.prefetch == 0 || consumer.unacked.len() < usize::from(consumer.prefetch) {
                let Some(message) = q.ready.pop_front() else {
                    break;
                };
                state.next_tag += 1;
                let tag = state.next_tag;
                outbox.push(
                    Delivery::new(
                        tag,
                        message.exchange.clone(),
                        message.routing_key.clone(),
                        message.payload.clone(),
                    )
                    .redelivered(message.redelivered),
                );
                consumer.unacked.insert(tag, message);
            }
            (Arc::clone(&consumer.callback), outbox)
        };

        let (callback, deliveries) = outbox;
        for delivery in deliveries {
            trace!(queue, delivery_tag = delivery.delivery_tag, "Delivering");
            callback(delivery);
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        if exchange.is_empty() {
            return state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_string()])
                .unwrap_or_default();
        }

        let mut queues: Vec<String> = Vec::new();
        for binding in &state.bindings {
            if binding.exchange == exchange
                && binding.pattern.matches(routing_key)
                && !queues.contains(&binding.queue)
            {
                queues.push(binding.queue.clone());
            }
        }
        queues
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(&self, exchange: &str, routing_key: &str, payload: Bytes) -> BrokerResult<()> {
        let queues = self.route(exchange, routing_key);
        if queues.is_empty() {
            trace!(exchange, routing_key, "Dropping unroutable message");
            return Ok(());
        }

        let message = Message {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload,
            redelivered: false,
        };
        self.enqueue(&queues, &message);
        for queue in &queues {
            self.pump(queue);
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelFactory for MemoryBroker {
    async fn open_consuming_channel(
        &self,
        queue: &str,
        prefetch_count: u16,
    ) -> BrokerResult<Arc<dyn ConsumingChannel>> {
        if !self.inner.state.lock().queues.contains_key(queue) {
            return Err(BrokerError::ChannelOpen {
                queue: queue.to_string(),
                reason: "queue is not declared".to_string(),
            });
        }

        let channel_id = self.inner.next_channel.fetch_add(1, Ordering::SeqCst);
        self.inner.opened_channels.fetch_add(1, Ordering::SeqCst);
        debug!(queue, channel_id, prefetch_count, "Channel opened");

        Ok(Arc::new(MemoryChannel {
            broker: self.clone(),
            queue: queue.to_string(),
            channel_id,
            prefetch: prefetch_count,
            closed: AtomicBool::new(false),
        }))
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("MemoryBroker")
            .field("queues", &state.queues.len())
            .field("bindings", &state.bindings.len())
            .finish()
    }
}

// ============================================================================
// MemoryChannel
// ============================================================================

/// A consuming channel on a [`MemoryBroker`] queue.
pub struct MemoryChannel {
    broker: MemoryBroker,
    queue: String,
    channel_id: u64,
    prefetch: u16,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(BrokerError::ChannelClosed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ConsumingChannel for MemoryChannel {
    fn queue(&self) -> &str {
        &self.queue
    }

    async fn consume(&self, on_delivery: DeliveryCallback) -> BrokerResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.broker.inner.state.lock();
            let Some(q) = state.queues.get_mut(&self.queue) else {
                return Err(BrokerError::Consume {
                    queue: self.queue.clone(),
                    reason: "queue was deleted".to_string(),
                });
            };
            if let Some(existing) = &q.consumer {
                return Err(BrokerError::Consume {
                    queue: self.queue.clone(),
                    reason: format!("queue already has consumer '{}'", existing.consumer_tag),
                });
            }

            let consumer_tag = format!("ctag-{}", Uuid::new_v4());
            debug!(queue = %self.queue, %consumer_tag, "Consumer attached");
            q.consumer = Some(ConsumerSlot {
                channel_id: self.channel_id,
                consumer_tag,
                prefetch: self.prefetch,
                callback: on_delivery,
                unacked: HashMap::new(),
            });
        }

        self.broker.pump(&self.queue);
        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64, outcome: AckOutcome) -> BrokerResult<()> {
        self.ensure_open()?;
        {
            let mut state = self.broker.inner.state.lock();
            let q = state
                .queues
                .get_mut(&self.queue)
                .filter(|q| {
                    q.consumer
                        .as_ref()
                        .is_some_and(|c| c.channel_id == self.channel_id)
                })
                .ok_or_else(|| BrokerError::Acknowledge {
                    delivery_tag,
                    reason: "channel is not consuming".to_string(),
                })?;

            let message = q
                .consumer
                .as_mut()
                .and_then(|c| c.unacked.remove(&delivery_tag))
                .ok_or_else(|| BrokerError::Acknowledge {
                    delivery_tag,
                    reason: "unknown delivery tag".to_string(),
                })?;

            match outcome {
                AckOutcome::Ack => q.acked += 1,
                AckOutcome::Nack => q.rejected += 1,
                AckOutcome::NackRequeue => {
                    let mut message = message;
                    message.redelivered = true;
                    q.ready.push_front(message);
                }
            }
            trace!(queue = %self.queue, delivery_tag, ?outcome, "Acknowledged");
        }

        self.broker.pump(&self.queue);
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.broker.inner.state.lock();
        if let Some(q) = state.queues.get_mut(&self.queue) {
            let owned = q
                .consumer
                .as_ref()
                .is_some_and(|c| c.channel_id == self.channel_id);
            if owned && let Some(consumer) = q.consumer.take() {
                let returned = consumer.unacked.len();
                q.return_unacked(consumer.unacked);
                debug!(queue = %self.queue, returned, "Consumer detached");
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("queue", &self.queue)
            .field("channel_id", &self.channel_id)
            .field("prefetch", &self.prefetch)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}
