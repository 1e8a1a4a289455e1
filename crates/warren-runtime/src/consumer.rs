//! Single-message consumer.
//!
//! Drives a [`Dispatcher`] from one queue. The broker callback only forwards
//! deliveries into an unbounded queue; one worker task dispatches them in
//! arrival order and applies each resulting decision. A delivery whose
//! dispatch panics is left unacknowledged and the worker moves on.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use warren_core::{
    AckDecision, BoxedChannelFactory, BrokerResult, ConsumingChannel, Delivery, DeliveryCallback,
};
use warren_framework::Dispatcher;

use crate::batch::EngineState;
use crate::config::{ConsumerConfig, validate_consumer};
use crate::error::{EngineError, EngineResult, panic_message};

struct Active {
    cancel: CancellationToken,
    channel: Arc<dyn ConsumingChannel>,
    task: JoinHandle<BrokerResult<()>>,
}

/// Consumes one queue and dispatches each delivery.
///
/// Shares the batch engine's lifecycle: `start` validates before opening a
/// channel, `stop` lets the delivery being dispatched finish, and both `stop`
/// and `dispose` are idempotent.
pub struct Consumer {
    config: ConsumerConfig,
    dispatcher: Arc<Dispatcher>,
    factory: BoxedChannelFactory,
    state: Mutex<EngineState>,
    lifecycle: tokio::sync::Mutex<Option<Active>>,
}

impl Consumer {
    /// Creates a stopped consumer.
    pub fn new(config: ConsumerConfig, dispatcher: Arc<Dispatcher>, factory: BoxedChannelFactory) -> Self {
        Self {
            config,
            dispatcher,
            factory,
            state: Mutex::new(EngineState::Stopped),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn queue_name(&self) -> &str {
        &self.config.queue_name
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock()
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock() = state;
    }

    /// Opens the channel and starts dispatching.
    ///
    /// # Errors
    ///
    /// Fails like [`BatchConsumer::start`](crate::BatchConsumer::start).
    pub async fn start(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match self.state() {
            EngineState::Disposed => {
                return Err(EngineError::Disposed {
                    queue: self.config.queue_name.clone(),
                });
            }
            EngineState::Running => {
                warn!(queue = %self.config.queue_name, "Consumer is already running");
                return Ok(());
            }
            _ => {}
        }

        validate_consumer(&self.config)?;
        self.set_state(EngineState::Starting);

        match self.open().await {
            Ok(active) => {
                *lifecycle = Some(active);
                self.set_state(EngineState::Running);
                info!(
                    queue = %self.config.queue_name,
                    prefetch = self.config.prefetch_count,
                    routes = self.dispatcher.route_count(),
                    "Consumer started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(EngineState::Stopped);
                error!(queue = %self.config.queue_name, error = %e, "Consumer failed to start");
                Err(e)
            }
        }
    }

    async fn open(&self) -> EngineResult<Active> {
        let channel = self
            .factory
            .open_consuming_channel(&self.config.queue_name, self.config.prefetch_count)
            .await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let on_delivery: DeliveryCallback = Arc::new(move |delivery: Delivery| {
            if tx.send(delivery).is_err() {
                trace!("Consumer worker gone, delivery left to the broker");
            }
        });

        if let Err(e) = channel.consume(on_delivery).await {
            if let Err(close_err) = channel.close().await {
                warn!(queue = %self.config.queue_name, error = %close_err, "Failed to close channel");
            }
            return Err(e.into());
        }

        let cancel = CancellationToken::new();
        let worker = Worker {
            dispatcher: Arc::clone(&self.dispatcher),
            channel: Arc::clone(&channel),
            cancel: cancel.clone(),
        };
        let span = info_span!("consumer", queue = %self.config.queue_name);
        let task = tokio::spawn(worker.run(rx).instrument(span));

        Ok(Active {
            cancel,
            channel,
            task,
        })
    }

    /// Stops dispatching and closes the channel. Queued deliveries that were
    /// not dispatched stay unacknowledged.
    pub async fn stop(&self) -> EngineResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        self.stop_active(&mut lifecycle).await
    }

    async fn stop_active(&self, lifecycle: &mut Option<Active>) -> EngineResult<()> {
        let Some(active) = lifecycle.take() else {
            debug!(queue = %self.config.queue_name, state = %self.state(), "Consumer is not running");
            return Ok(());
        };

        self.set_state(EngineState::Stopping);
        active.cancel.cancel();
        let result = match active.task.await {
            Ok(closed) => closed.map_err(EngineError::from),
            Err(e) => {
                // The worker died before it could close the channel.
                error!(queue = %self.config.queue_name, error = %e, "Consumer worker failed");
                active.channel.close().await.map_err(EngineError::from)
            }
        };

        self.set_state(EngineState::Stopped);
        info!(queue = %self.config.queue_name, "Consumer stopped");
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
        result
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        if let Some(active) = self.lifecycle.get_mut().take() {
            active.cancel.cancel();
        }
    }
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("queue", &self.config.queue_name)
            .field("state", &self.state())
            .finish()
    }
}

struct Worker {
    dispatcher: Arc<Dispatcher>,
    channel: Arc<dyn ConsumingChannel>,
    cancel: CancellationToken,
}

impl Worker {
    async fn run(self, mut deliveries: mpsc::UnboundedReceiver<Delivery>) -> BrokerResult<()> {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                next = deliveries.recv() => match next {
                    Some(delivery) => self.handle(delivery).await,
                    None => break,
                },
            }
        }

        deliveries.close();
        self.channel.close().await
    }

    async fn handle(&self, delivery: Delivery) {
        let tag = delivery.delivery_tag;
        let dispatched = AssertUnwindSafe(self.dispatcher.dispatch(delivery))
            .catch_unwind()
            .await;
        let decision = match dispatched {
            Ok(Ok(decision)) => decision,
            Err(panic) => {
                error!(delivery_tag = tag, error = %panic_message(panic.as_ref()), "Dispatch panicked");
                AckDecision::Pending
            }
            Ok(Err(e)) => {
                error!(
                    delivery_tag = tag,
                    handler = e.handler(),
                    decision = %e.decision(),
                    error = %e,
                    "Dispatch failed"
                );
                e.decision()
            }
        };

        match decision.outcome() {
            Some(outcome) => {
                if let Err(e) = self.channel.acknowledge(tag, outcome).await {
                    warn!(delivery_tag = tag, error = %e, "Failed to acknowledge");
                }
            }
            None => trace!(delivery_tag = tag, "Delivery left unacknowledged"),
        }
    }
}
