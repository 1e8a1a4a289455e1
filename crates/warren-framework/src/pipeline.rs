//! Generic pipeline composition.
//!
//! Both the single-message middleware chain and the batch filter chain are
//! built from the same primitive: an ordered list of [`Middleware`] units
//! folded right-to-left around a terminal tower [`Service`]:
//!
//! ```text
//! entries (sorted by order, then insertion)
//!     m[0] ─wraps─▶ m[1] ─wraps─▶ … ─wraps─▶ terminal
//! ```
//!
//! Every unit receives the payload and a [`Next`] continuation. It may work
//! before or after calling `next`, or return without calling it to
//! short-circuit everything downstream. The composed pipeline is a
//! [`PipelineService`], compiled once and cloned freely.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tower::util::BoxCloneSyncService;
use tower::{BoxError, Layer, Service, ServiceExt};

/// A compiled, type-erased pipeline over payload `P`.
pub type PipelineService<P> = BoxCloneSyncService<P, (), BoxError>;

/// Which chain a pipeline belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    /// The main processing chain.
    Normal,
    /// The error-handling chain.
    Error,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Error => write!(f, "error"),
        }
    }
}

// ============================================================================
// Next
// ============================================================================

/// The remainder of a pipeline after the current unit.
pub struct Next<P> {
    inner: PipelineService<P>,
}

impl<P> Clone for Next<P> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + 'static> Next<P> {
    /// Wraps a compiled pipeline so it can be driven directly.
    pub fn new(inner: PipelineService<P>) -> Self {
        Self { inner }
    }

    /// Runs the rest of the pipeline.
    pub async fn run(self, input: P) -> Result<(), BoxError> {
        self.inner.oneshot(input).await
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// A unit of a pipeline.
///
/// # Example
///
/// ```rust,ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Middleware<Arc<MessageContext>> for Timing {
///     async fn invoke(&self, ctx: Arc<MessageContext>, next: Next<Arc<MessageContext>>) -> Result<(), BoxError> {
///         let start = Instant::now();
///         let result = next.run(ctx).await;
///         tracing::debug!(elapsed = ?start.elapsed());
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait Middleware<P>: Send + Sync + 'static {
    /// Processes `input`, optionally delegating to `next`.
    async fn invoke(&self, input: P, next: Next<P>) -> Result<(), BoxError>;
}

#[async_trait]
impl<P, M> Middleware<P> for Arc<M>
where
    P: Send + 'static,
    M: Middleware<P> + ?Sized,
{
    async fn invoke(&self, input: P, next: Next<P>) -> Result<(), BoxError> {
        (**self).invoke(input, next).await
    }
}

/// A middleware backed by an async closure. Created by [`middleware_fn`].
pub struct MiddlewareFn<F, P> {
    f: F,
    _marker: PhantomData<fn(P)>,
}

/// Builds a [`Middleware`] from an async closure.
///
/// ```rust,ignore
/// let skip_redelivered = middleware_fn(|ctx: Arc<MessageContext>, next: Next<_>| async move {
///     if ctx.is_redelivered() {
///         ctx.nack();
///         return Ok(());
///     }
///     next.run(ctx).await
/// });
/// ```
pub fn middleware_fn<F, P, Fut>(f: F) -> MiddlewareFn<F, P>
where
    F: Fn(P, Next<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    P: Send + 'static,
{
    MiddlewareFn {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, P, Fut> Middleware<P> for MiddlewareFn<F, P>
where
    F: Fn(P, Next<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    P: Send + 'static,
{
    async fn invoke(&self, input: P, next: Next<P>) -> Result<(), BoxError> {
        (self.f)(input, next).await
    }
}

// ============================================================================
// MiddlewareLayer / MiddlewareService
// ============================================================================

/// A tower [`Layer`] placing one middleware in front of a pipeline.
pub struct MiddlewareLayer<P> {
    middleware: Arc<dyn Middleware<P>>,
}

impl<P> Clone for MiddlewareLayer<P> {
    fn clone(&self) -> Self {
        Self {
            middleware: Arc::clone(&self.middleware),
        }
    }
}

impl<P: Send + 'static> MiddlewareLayer<P> {
    /// Creates a layer for `middleware`.
    pub fn new(middleware: Arc<dyn Middleware<P>>) -> Self {
        Self { middleware }
    }
}

impl<P: Send + 'static> Layer<PipelineService<P>> for MiddlewareLayer<P> {
    type Service = MiddlewareService<P>;

    fn layer(&self, inner: PipelineService<P>) -> Self::Service {
        MiddlewareService {
            middleware: Arc::clone(&self.middleware),
            inner,
        }
    }
}

/// The service produced by [`MiddlewareLayer`].
pub struct MiddlewareService<P> {
    middleware: Arc<dyn Middleware<P>>,
    inner: PipelineService<P>,
}

impl<P> Clone for MiddlewareService<P> {
    fn clone(&self) -> Self {
        Self {
            middleware: Arc::clone(&self.middleware),
            inner: self.inner.clone(),
        }
    }
}

impl<P: Send + 'static> Service<P> for MiddlewareService<P> {
    type Response = ();
    type Error = BoxError;
    type Future = BoxFuture<'static, Result<(), BoxError>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, input: P) -> Self::Future {
        let middleware = Arc::clone(&self.middleware);
        let next = Next::new(self.inner.clone());
        Box::pin(async move { middleware.invoke(input, next).await })
    }
}

// ============================================================================
// PipelineBuilder
// ============================================================================

struct Entry<P> {
    order: i32,
    seq: usize,
    middleware: Arc<dyn Middleware<P>>,
}

impl<P> Clone for Entry<P> {
    fn clone(&self) -> Self {
        Self {
            order: self.order,
            seq: self.seq,
            middleware: Arc::clone(&self.middleware),
        }
    }
}

/// An ordered list of middleware units awaiting a terminal.
///
/// Units run in ascending `order`; equal orders keep insertion order. The
/// builder can be compiled any number of times against different terminals.
pub struct PipelineBuilder<P> {
    stage: Stage,
    entries: Vec<Entry<P>>,
}

impl<P> Clone for PipelineBuilder<P> {
    fn clone(&self) -> Self {
        Self {
            stage: self.stage,
            entries: self.entries.clone(),
        }
    }
}

impl<P: Send + 'static> PipelineBuilder<P> {
    /// Creates an empty builder for `stage`.
    pub fn new(stage: Stage) -> Self {
        Self {
            stage,
            entries: Vec::new(),
        }
    }

    /// Returns the stage this builder composes.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    /// Adds a unit at `order`.
    pub fn add(&mut self, order: i32, middleware: impl Middleware<P>) {
        self.add_shared(order, Arc::new(middleware));
    }

    /// Adds an already shared unit at `order`.
    pub fn add_shared(&mut self, order: i32, middleware: Arc<dyn Middleware<P>>) {
        let seq = self.entries.len();
        self.entries.push(Entry {
            order,
            seq,
            middleware,
        });
    }

    /// Adds a unit at `order` (builder pattern).
    pub fn with(mut self, order: i32, middleware: impl Middleware<P>) -> Self {
        self.add(order, middleware);
        self
    }

    /// Returns the number of units.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if no unit was added.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Compiles the units around `terminal`.
    pub fn build<S>(&self, terminal: S) -> PipelineService<P>
    where
        S: Service<P, Response = (), Error = BoxError> + Clone + Send + Sync + 'static,
        S::Future: Send + 'static,
    {
        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| (e.order, e.seq));

        entries
            .into_iter()
            .rev()
            .fold(BoxCloneSyncService::new(terminal), |inner, entry| {
                BoxCloneSyncService::new(MiddlewareLayer::new(entry.middleware).layer(inner))
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    type Log = Arc<Mutex<Vec<String>>>;

    struct Record {
        name: &'static str,
        log: Log,
        call_next: bool,
    }

    #[async_trait]
    impl Middleware<u32> for Record {
        async fn invoke(&self, input: u32, next: Next<u32>) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            if self.call_next {
                next.run(input).await?;
            }
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            Ok(())
        }
    }

    fn terminal(
        log: Log,
    ) -> impl Service<u32, Response = (), Error = BoxError, Future: Send + 'static>
    + Clone
    + Send
    + Sync
    + 'static {
        tower::service_fn(move |input: u32| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(format!("terminal:{input}"));
                Ok::<_, BoxError>(())
            }
        })
    }

    fn record(name: &'static str, log: &Log, call_next: bool) -> Record {
        Record {
            name,
            log: Arc::clone(log),
            call_next,
        }
    }

    #[tokio::test]
    async fn test_order_then_insertion() {
        let log: Log = Arc::default();
        let pipeline = PipelineBuilder::new(Stage::Normal)
            .with(10, record("late", &log, true))
            .with(0, record("a", &log, true))
            .with(0, record("b", &log, true))
            .build(terminal(Arc::clone(&log)));

        Next::new(pipeline).run(7).await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            [
                "a:before",
                "b:before",
                "late:before",
                "terminal:7",
                "late:after",
                "b:after",
                "a:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_downstream() {
        let log: Log = Arc::default();
        let pipeline = PipelineBuilder::new(Stage::Normal)
            .with(0, record("m1", &log, false))
            .with(1, record("m2", &log, true))
            .build(terminal(Arc::clone(&log)));

        tokio_test::assert_ok!(Next::new(pipeline).run(1).await);
        assert_eq!(*log.lock().unwrap(), ["m1:before", "m1:after"]);
    }

    #[tokio::test]
    async fn test_middleware_fn_and_reuse() {
        let log: Log = Arc::default();
        let builder = PipelineBuilder::new(Stage::Normal).with(
            0,
            middleware_fn(|input: u32, next: Next<u32>| async move { next.run(input * 2).await }),
        );
        let pipeline = builder.build(terminal(Arc::clone(&log)));

        Next::new(pipeline.clone()).run(2).await.unwrap();
        Next::new(pipeline).run(5).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["terminal:4", "terminal:10"]);
    }

    #[test]
    fn test_errors_propagate_outwards() {
        let pipeline = PipelineBuilder::<u32>::new(Stage::Normal)
            .with(0, middleware_fn(|input, next: Next<u32>| next.run(input)))
            .build(tower::service_fn(|_: u32| async {
                Err::<(), BoxError>("boom".into())
            }));

        let err = tokio_test::assert_err!(tokio_test::block_on(Next::new(pipeline).run(0)));
        assert_eq!(err.to_string(), "boom");
    }
}
