//! Batch filter pipeline.
//!
//! The same composition primitive as the single-message chain, applied to a
//! [`Batch`] of deliveries. Filters may inspect, reorder or drop deliveries
//! before calling `next`; the terminal invokes the [`BatchHandler`] with the
//! surviving deliveries. There is no error chain: failures propagate to the
//! consumption engine.
//!
//! ```rust,ignore
//! let pipeline = BatchPipeline::builder()
//!     .filter(0, DedupFilter)
//!     .filter(10, SkipEmpty)
//!     .build(|batch: Batch| async move {
//!         store_all(batch.deliveries()).await?;
//!         batch.ack();
//!         Ok::<_, BoxError>(())
//!     });
//! ```

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::trace;
use warren_core::{AckDecision, Delivery};

use crate::handler::IntoHandlerResult;
use crate::pipeline::{Middleware, Next, PipelineBuilder, PipelineService, Stage};

// ============================================================================
// Batch
// ============================================================================

/// A group of deliveries drained from the batch buffer in one tick.
///
/// The acknowledgment decision is shared with the engine that created the
/// batch, so it survives filters that consume and rebuild the batch.
pub struct Batch {
    deliveries: Vec<Delivery>,
    cancellation: CancellationToken,
    decision: Arc<Mutex<AckDecision>>,
}

impl Batch {
    /// Creates a batch with a pending decision.
    pub fn new(deliveries: Vec<Delivery>, cancellation: CancellationToken) -> Self {
        Self {
            deliveries,
            cancellation,
            decision: Arc::new(Mutex::new(AckDecision::Pending)),
        }
    }

    /// Returns the deliveries in arrival order.
    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Returns the deliveries for in-place reordering or removal.
    pub fn deliveries_mut(&mut self) -> &mut Vec<Delivery> {
        &mut self.deliveries
    }

    /// Keeps only the deliveries for which `keep` returns `true`.
    pub fn retain(&mut self, keep: impl FnMut(&Delivery) -> bool) {
        self.deliveries.retain(keep);
    }

    /// Consumes the batch, returning its deliveries.
    pub fn into_deliveries(self) -> Vec<Delivery> {
        self.deliveries
    }

    /// Returns the number of deliveries.
    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    /// Returns `true` if the batch holds no delivery.
    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Returns the cooperative cancellation token.
    ///
    /// The token is cancelled when the engine stops; long-running handlers
    /// should check it and wind down.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Returns `true` once the engine has asked the handler to stop.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Returns a handle to the shared decision.
    pub fn decision_handle(&self) -> Arc<Mutex<AckDecision>> {
        Arc::clone(&self.decision)
    }

    /// Returns the batch decision.
    pub fn decision(&self) -> AckDecision {
        *self.decision.lock()
    }

    /// Overwrites the batch decision.
    pub fn set_decision(&self, decision: AckDecision) {
        *self.decision.lock() = decision;
    }

    /// Acknowledges every delivery in the batch.
    pub fn ack(&self) {
        self.set_decision(AckDecision::Ack);
    }

    /// Rejects every delivery in the batch.
    pub fn nack(&self) {
        self.set_decision(AckDecision::Nack);
    }

    /// Requeues every delivery in the batch.
    pub fn requeue(&self) {
        self.set_decision(AckDecision::Requeue);
    }
}

impl std::fmt::Debug for Batch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batch")
            .field("len", &self.deliveries.len())
            .field("decision", &self.decision())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

// ============================================================================
// BatchHandler
// ============================================================================

/// Processes a whole batch.
///
/// Implemented for async closures taking a [`Batch`] and returning `()` or
/// `Result<(), E>`.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Handles the batch.
    async fn handle(&self, batch: Batch) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut, Res> BatchHandler for F
where
    F: Fn(Batch) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Res> + Send + 'static,
    Res: IntoHandlerResult + 'static,
{
    async fn handle(&self, batch: Batch) -> Result<(), BoxError> {
        (self)(batch).await.into_handler_result()
    }
}

// ============================================================================
// BatchPipeline
// ============================================================================

/// A compiled batch filter pipeline.
#[derive(Clone)]
pub struct BatchPipeline {
    service: PipelineService<Batch>,
}

impl BatchPipeline {
    /// Starts an empty filter list.
    pub fn builder() -> BatchPipelineBuilder {
        BatchPipelineBuilder::default()
    }

    /// Runs the filters and the handler over `batch`.
    pub async fn run(&self, batch: Batch) -> Result<(), BoxError> {
        Next::new(self.service.clone()).run(batch).await
    }
}

impl std::fmt::Debug for BatchPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPipeline").finish_non_exhaustive()
    }
}

/// Collects filters for a [`BatchPipeline`].
#[derive(Clone)]
pub struct BatchPipelineBuilder {
    filters: PipelineBuilder<Batch>,
}

impl Default for BatchPipelineBuilder {
    fn default() -> Self {
        Self {
            filters: PipelineBuilder::new(Stage::Normal),
        }
    }
}

impl BatchPipelineBuilder {
    /// Adds a filter at `order`. Lower runs first.
    pub fn filter(mut self, order: i32, filter: impl Middleware<Batch>) -> Self {
        self.filters.add(order, filter);
        self
    }

    /// Adds a filter at `order` without consuming the builder.
    pub fn add_filter(&mut self, order: i32, filter: impl Middleware<Batch>) {
        self.filters.add(order, filter);
    }

    /// Returns the number of filters.
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Returns `true` if no filter was added.
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Compiles the filters around `handler`.
    pub fn build(&self, handler: impl BatchHandler) -> BatchPipeline {
        let handler: Arc<dyn BatchHandler> = Arc::new(handler);
        let terminal = tower::service_fn(move |batch: Batch| {
            let handler = Arc::clone(&handler);
            async move { handler.handle(batch).await }
        });

        BatchPipeline {
            service: self.filters.build(terminal),
        }
    }
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Drops deliveries whose routing key and payload repeat an earlier delivery
/// of the same batch.
///
/// Dropped deliveries are still acknowledged with the rest of the batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DedupFilter;

#[async_trait]
impl Middleware<Batch> for DedupFilter {
    async fn invoke(&self, mut batch: Batch, next: Next<Batch>) -> Result<(), BoxError> {
        let before = batch.len();
        let mut seen: HashSet<(String, Bytes)> = HashSet::with_capacity(before);
        batch.retain(|d| seen.insert((d.routing_key.clone(), d.payload.clone())));

        if batch.len() != before {
            trace!(dropped = before - batch.len(), "Dropped duplicate deliveries");
        }
        next.run(batch).await
    }
}

/// Stops the pipeline when the batch is empty, so the handler never sees an
/// empty batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkipEmpty;

#[async_trait]
impl Middleware<Batch> for SkipEmpty {
    async fn invoke(&self, batch: Batch, next: Next<Batch>) -> Result<(), BoxError> {
        if batch.is_empty() {
            trace!("Skipping empty batch");
            return Ok(());
        }
        next.run(batch).await
    }
}
