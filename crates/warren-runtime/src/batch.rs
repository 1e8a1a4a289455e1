//! Batch consumption engine.
//!
//! A [`BatchConsumer`] consumes one queue, buffers every delivery it receives
//! and, on each tick of its timer, hands the buffered deliveries to a
//! [`BatchPipeline`] as one [`Batch`].
//!
//! ```text
//!   broker callback ──push──▶ buffer ◀──mem::take── flush task (tick / full)
//!                                                        │
//!                                           filters ▶ batch handler
//!                                                        │
//!                                       acknowledge every drained tag
//! ```
//!
//! Lifecycle: `Stopped → Starting → Running → Stopping → Stopped`, and
//! `Disposed` once [`BatchConsumer::dispose`] has run.
//!
//! Acknowledgment after a flush:
//!
//! | Pipeline result | Batch decision | Sent to broker |
//! |---|---|---|
//! | `Ok` | pending | ack |
//! | `Ok` / `Err` | ack, nack or requeue | that decision |
//! | `Err` | pending | nothing; deliveries stay unacknowledged |
//!
//! Deliveries dropped by a filter share the fate of their batch. A panicking
//! handler counts as `Err`; the timer keeps running.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use warren_core::{
    AckDecision, BoxedChannelFactory, BrokerResult, ConsumingChannel, Delivery, DeliveryCallback,
};
use warren_framework::{
    Batch, BatchHandler, BatchPipeline, BatchPipelineBuilder, BoxError, Middleware,
};

use crate::config::{BatchConsumerConfig, validate_batch_consumer};
use crate::error::{EngineError, EngineResult, panic_message};

/// Lifecycle state of a consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Terminal; the consumer cannot be started again.
    Disposed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// Collects the filters of a batch consumer.
pub struct BatchConsumerBuilder {
    config: BatchConsumerConfig,
    filters: BatchPipelineBuilder,
}

impl BatchConsumerBuilder {
    /// Adds a filter at `order`. Lower runs first.
    pub fn filter(mut self, order: i32, filter: impl Middleware<Batch>) -> Self {
        self.filters.add_filter(order, filter);
        self
    }

    /// Finishes the declaration with the batch handler.
    pub fn handler(self, handler: impl BatchHandler) -> BatchRoute {
        BatchRoute {
            config: self.config,
            pipeline: self.filters.build(handler),
        }
    }
}

/// A batch handler with its queue settings and compiled filters, waiting for
/// a channel factory.
#[derive(Debug, Clone)]
pub struct BatchRoute {
    config: BatchConsumerConfig,
    pipeline: BatchPipeline,
}

impl BatchRoute {
    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &BatchConsumerConfig {
        &self.config
    }

    /// Replaces the queue settings, keeping the pipeline.
    pub fn with_config(mut self, config: BatchConsumerConfig) -> Self {
        self.config = config;
        self
    }

    /// Creates a stopped consumer that opens its channel through `factory`.
    pub fn bind(self, factory: BoxedChannelFactory) -> BatchConsumer {
        BatchConsumer {
            config: self.config,
            pipeline: self.pipeline,
            factory,
            buffer: Arc::new(Buffer::default()),
            state: Mutex::new(EngineState::Stopped),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Default)]
struct Buffer {
    deliveries: Mutex<Vec<Delivery>>,
}

impl Buffer {
    /// Appends and returns the new length.
    fn push(&self, delivery: Delivery) -> usize {
        let mut deliveries = self.deliveries.lock();
        deliveries.push(delivery);
        deliveries.len()
    }

    fn drain(&self) -> Vec<Delivery> {
        std::mem::take(&mut *self.deliveries.lock())
    }

    fn len(&self) -> usize {
        self.deliveries.lock().len()
    }
}

/// Resources held while running.
struct Active {
    cancel: CancellationToken,
    channel: Arc<dyn ConsumingChannel>,
    task: JoinHandle<BrokerResult<()>>,
}

/// Consumes a queue in timed batches.
///
/// ```rust,ignore
/// let consumer = BatchConsumer::builder(BatchConsumerConfig::new("audit"))
///     .filter(0, DedupFilter)
///     .filter(10, SkipEmpty)
///     .handler(|batch: Batch| async move { store(batch.deliveries()).await })
///     .bind(Arc::new(broker));
///
/// consumer.start().await?;
/// // ...
/// consumer.dispose().await?;
/// ```
pub struct BatchConsumer {
    config: BatchConsumerConfig,
    pipeline: BatchPipeline,
    factory: BoxedChannelFactory,
    buffer: Arc<Buffer>,
    state: Mutex<EngineState>,
    // Serializes start, stop and dispose.
    lifecycle: tokio::sync::Mutex<Option<Active>>,
}

impl BatchConsumer {
    /// Starts declaring a batch consumer for `config.queue_name`.
    pub fn builder(config: BatchConsumerConfig) -> BatchConsumerBuilder {
        BatchConsumerBuilder {
            config,
            filters: BatchPipeline::builder(),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn config(&self) -> &BatchConsumerConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    /// Number of deliveries received since the last flush.
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
    }

    /// Validates the configuration, opens the channel, starts consuming and
    /// arms the flush timer.
    ///
    /// Starting a running consumer logs a warning and succeeds.
    ///
    /// # Errors
    ///
    /// - [`EngineError::Disposed`] after [`dispose`](Self::dispose)
    /// - [`EngineError::Config`] for an invalid configuration, before any
    ///   channel is opened
    /// - [`EngineError::Broker`] if the channel cannot be opened or consumed
    pub async fn start(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            EngineState::Disposed => {
                return Err(EngineError::Disposed {
                    queue: self.config.queue_name.clone(),
                });
            }
            EngineState::Running => {
                warn!(queue = %self.config.queue_name, "Batch consumer is already running");
                return Ok(());
            }
            _ => {}
        }

        validate_batch_consumer(&self.config)?;
        self.set_state(EngineState::Starting);

        match self.open().await {
            Ok(active) => {
                *lifecycle = Some(active);
                self.set_state(EngineState::Running);
                info!(
                    queue = %self.config.queue_name,
                    prefetch = self.config.prefetch_count,
                    period_ms = self.config.period_ms,
                    due_time_ms = self.config.due_time_ms,
                    "Batch consumer started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(EngineState::Stopped);
                error!(queue = %self.config.queue_name, error = %e, "Batch consumer failed to start");
                Err(e)
            }
        }
    }

    async fn open(&self) -> EngineResult<Active> {
        let channel = self
            .factory
            .open_consuming_channel(&self.config.queue_name, self.config.prefetch_count)
            .await?;

        // One signal per run, so a stale permit cannot flush a restarted
        // consumer early.
        let full = Arc::new(Notify::new());
        let buffer = Arc::clone(&self.buffer);
        let signal = Arc::clone(&full);
        let flush_at = self
            .config
            .flush_on_full
            .then_some(usize::from(self.config.prefetch_count));
        let on_delivery: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            let len = buffer.push(delivery);
            if flush_at.is_some_and(|limit| len >= limit) {
                signal.notify_one();
            }
        });

        if let Err(e) = channel.consume(on_delivery).await {
            if let Err(close_err) = channel.close().await {
                warn!(queue = %self.config.queue_name, error = %close_err, "Failed to close channel");
            }
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let flusher = Flusher {
            queue: self.config.queue_name.clone(),
            pipeline: self.pipeline.clone(),
            channel: Arc::clone(&channel),
            buffer: Arc::clone(&self.buffer),
            full,
            cancel: cancel.clone(),
        };
        let span = info_span!("batch_consumer", queue = %self.config.queue_name);
        let task = tokio::spawn(flusher.run(self.config.clone()).instrument(span));

        Ok(Active {
            cancel,
            channel,
            task,
        })
    }

    /// Disarms the timer, waits for an in-flight batch to finish and closes
    /// the channel.
    ///
    /// Buffered deliveries that were never flushed stay unacknowledged and are
    /// returned to the queue by the broker. Stopping a stopped consumer is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Broker`] if closing the channel fails; the
    /// consumer is stopped either way.
    pub async fn stop(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_active(&mut lifecycle).await
    }

    async fn stop_active(&self, lifecycle: &mut Option<Active>) -> EngineResult<()> {
        let Some(active) = lifecycle.take() else {
            debug!(queue = %self.config.queue_name, state = %self.state(), "Batch consumer is not running");
            return Ok(());
        };

        self.set_state(EngineState::Stopping);
        active.cancel.cancel();

        let result = match active.task.await {
            Ok(closed) => closed.map_err(EngineError::from),
            Err(e) => {
                // The task died before it could close the channel.
                error!(queue = %self.config.queue_name, error = %e, "Flush task failed");
                active.channel.close().await.map_err(EngineError::from)
            }
        };

        let discarded = self.buffer.drain().len();
        self.set_state(EngineState::Stopped);
        info!(queue = %self.config.queue_name, unflushed = discarded, "Batch consumer stopped");
        result
    }

    /// Stops the consumer and releases it for good. Idempotent.
    pub async fn dispose(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.state() == EngineState::Disposed {
            return Ok(());
        }

        let result = self.stop_active(&mut lifecycle).await;
        self.set_state(EngineState::Disposed);
        debug!(queue = %self.config.queue_name, "Batch consumer disposed");
        result
    }
}

impl Drop for BatchConsumer {
    fn drop(&mut self) {
        // The flush task closes the channel once cancelled.
        if let Some(active) = self.lifecycle.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl fmt::Debug for BatchConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchConsumer")
            .field("queue", &self.config.queue_name)
            .field("state", &self.state())
            .field("buffered", &self.buffered_len())
            .finish()
    }
}

// ============================================================================
// Flush task
// ============================================================================

struct Flusher {
    queue: String,
    pipeline: BatchPipeline,
    channel: Arc<dyn ConsumingChannel>,
    buffer: Arc<Buffer>,
    full: Arc<Notify>,
    cancel: CancellationToken,
}

impl Flusher {
    /// Flushes on every tick or early-flush signal until cancelled, then
    /// closes the channel.
    async fn run(self, config: BatchConsumerConfig) -> BrokerResult<()> {
        let start = Instant::now() + config.due_time();
        let mut ticker = tokio::time::interval_at(start, config.period());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
                () = self.full.notified() => {
                    trace!("Buffer full, flushing early");
                    ticker.reset();
                }
            }
            self.flush().await;
        }

        self.channel.close().await
    }

    async fn flush(&self) {
        let deliveries = self.buffer.drain();
        let tags: Vec<u64> = deliveries.iter().map(|d| d.delivery_tag).collect();

        let batch = Batch::new(deliveries, self.cancel.clone());
        let decision = batch.decision_handle();
        let span = info_span!("batch", queue = %self.queue, size = tags.len());

        let result = AssertUnwindSafe(self.pipeline.run(batch).instrument(span))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(BoxError::from(panic_message(panic.as_ref()))));
        let decision = *decision.lock();

        let decision = match (&result, decision) {
            (Ok(()), AckDecision::Pending) => AckDecision::Ack,
            (Ok(()), decision) => decision,
            (Err(e), decision) => {
                error!(queue = %self.queue, size = tags.len(), %decision, error = %e, "Batch handler failed");
                decision
            }
        };

        let Some(outcome) = decision.outcome() else {
            warn!(
                queue = %self.queue,
                size = tags.len(),
                "Batch left unacknowledged"
            );
            return;
        };

        for tag in &tags {
            if let Err(e) = self.channel.acknowledge(*tag, outcome).await {
                warn!(queue = %self.queue, delivery_tag = tag, error = %e, "Failed to acknowledge");
            }
        }
        if !tags.is_empty() {
            debug!(queue = %self.queue, size = tags.len(), %decision, "Batch acknowledged");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::mpsc;
    use warren_core::{AckOutcome, BrokerError, ChannelFactory};
    use warren_framework::SkipEmpty;

    use super::*;

    /// Refuses every channel and counts the attempts.
    #[derive(Default)]
    struct RefusingFactory {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl ChannelFactory for RefusingFactory {
        async fn open_consuming_channel(
            &self,
            queue: &str,
            _prefetch_count: u16,
        ) -> BrokerResult<Arc<dyn ConsumingChannel>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(BrokerError::ChannelOpen {
                queue: queue.to_string(),
                reason: "refused".to_string(),
            })
        }
    }

    fn consumer(config: BatchConsumerConfig, factory: Arc<RefusingFactory>) -> BatchConsumer {
        BatchConsumer::builder(config)
            .filter(0, SkipEmpty)
            .handler(|_: Batch| async {})
            .bind(factory)
    }

    #[tokio::test]
    async fn test_invalid_config_fails_before_opening() {
        let factory = Arc::new(RefusingFactory::default());
        let consumer = consumer(BatchConsumerConfig::new(""), Arc::clone(&factory));

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(consumer.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_open_failure_leaves_consumer_stopped() {
        let factory = Arc::new(RefusingFactory::default());
        let consumer = consumer(BatchConsumerConfig::new("audit"), Arc::clone(&factory));

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(BrokerError::ChannelOpen { .. })));
        assert_eq!(factory.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_start_after_dispose_fails() {
        let factory = Arc::new(RefusingFactory::default());
        let consumer = consumer(BatchConsumerConfig::new("audit"), factory);

        consumer.dispose().await.unwrap();
        consumer.dispose().await.unwrap();
        assert_eq!(consumer.state(), EngineState::Disposed);
        assert!(matches!(
            consumer.start().await,
            Err(EngineError::Disposed { .. })
        ));
    }

    /// Hands out channels whose deliveries the test pushes by hand.
    #[derive(Default)]
    struct ScriptedFactory {
        callback: Arc<Mutex<Option<DeliveryCallback>>>,
        closed: Arc<AtomicUsize>,
        panic_on_ack: bool,
        refuse_consume: bool,
    }

    impl ScriptedFactory {
        fn push(&self, tag: u64) {
            let callback = self.callback.lock().clone();
            if let Some(callback) = callback {
                callback(Delivery::new(tag, "", "audit", "{}"));
            }
        }

        fn closed(&self) -> usize {
            self.closed.load(Ordering::SeqCst)
        }
    }

    struct ScriptedChannel {
        callback: Arc<Mutex<Option<DeliveryCallback>>>,
        closed: Arc<AtomicUsize>,
        panic_on_ack: bool,
        refuse_consume: bool,
    }

    #[async_trait]
    impl ChannelFactory for ScriptedFactory {
        async fn open_consuming_channel(
            &self,
            _queue: &str,
            _prefetch_count: u16,
        ) -> BrokerResult<Arc<dyn ConsumingChannel>> {
            *self.callback.lock() = None;
            Ok(Arc::new(ScriptedChannel {
                callback: Arc::clone(&self.callback),
                closed: Arc::clone(&self.closed),
                panic_on_ack: self.panic_on_ack,
                refuse_consume: self.refuse_consume,
            }))
        }
    }

    #[async_trait]
    impl ConsumingChannel for ScriptedChannel {
        fn queue(&self) -> &str {
            "audit"
        }

        async fn consume(&self, on_delivery: DeliveryCallback) -> BrokerResult<()> {
            if self.refuse_consume {
                return Err(BrokerError::Consume {
                    queue: "audit".to_string(),
                    reason: "queue locked".to_string(),
                });
            }
            *self.callback.lock() = Some(on_delivery);
            Ok(())
        }

        async fn acknowledge(&self, _delivery_tag: u64, _outcome: AckOutcome) -> BrokerResult<()> {
            assert!(!self.panic_on_ack, "connection reset");
            Ok(())
        }

        async fn close(&self) -> BrokerResult<()> {
            self.closed.fetch_add(1, Ordering::SeqCst);
            if self.refuse_consume {
                return Err(BrokerError::ChannelClosed);
            }
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_signal_does_not_outlive_a_run() {
        let factory = Arc::new(ScriptedFactory::default());
        let config = BatchConsumerConfig::new("audit")
            .with_prefetch(2)
            .with_due_time(Duration::from_millis(10))
            .with_period(Duration::from_secs(3600))
            .with_flush_on_full(true);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let consumer = BatchConsumer::builder(config)
            .handler(move |batch: Batch| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(batch.len());
                    batch.cancellation().cancelled().await;
                }
            })
            .bind(factory.clone());

        consumer.start().await.unwrap();
        // The first tick flushes an empty buffer and the handler holds it
        // open, so filling the buffer signals a flusher that is busy.
        assert_eq!(rx.recv().await.unwrap(), 0);
        factory.push(1);
        factory.push(2);
        consumer.stop().await.unwrap();

        consumer.start().await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(rx.try_recv().is_err());
        consumer.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_closes_channel_after_flush_task_dies() {
        let factory = Arc::new(ScriptedFactory {
            panic_on_ack: true,
            ..ScriptedFactory::default()
        });
        let config = BatchConsumerConfig::new("audit")
            .with_due_time(Duration::from_millis(10))
            .with_period(Duration::from_millis(10));
        let consumer = BatchConsumer::builder(config)
            .handler(|_: Batch| async {})
            .bind(factory.clone());

        consumer.start().await.unwrap();
        factory.push(1);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(factory.closed(), 0);

        consumer.stop().await.unwrap();
        assert_eq!(factory.closed(), 1);
        assert_eq!(consumer.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_refused_consume_closes_channel_and_reports_consume_error() {
        let factory = Arc::new(ScriptedFactory {
            refuse_consume: true,
            ..ScriptedFactory::default()
        });
        let consumer = BatchConsumer::builder(BatchConsumerConfig::new("audit"))
            .handler(|_: Batch| async {})
            .bind(factory.clone());

        let err = consumer.start().await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(BrokerError::Consume { .. })));
        assert_eq!(factory.closed(), 1);
        assert_eq!(consumer.state(), EngineState::Stopped);
    }
}
