//! Single-message middleware pipeline.
//!
//! A [`MessagePipeline`] is compiled once per handler registration from two
//! independently ordered chains:
//!
//! - the **normal** chain of [`Middleware<Arc<MessageContext>>`] units wrapped
//!   around the handler invocation;
//! - the **error** chain of [`Middleware<Failure>`] units, entered when the
//!   normal chain returns an error.
//!
//! An error middleware receives the context and the original error. Calling
//! `next` continues down the error chain, whose terminal is a no-op, so an
//! error that reaches the end of the chain is swallowed. Returning `Err`
//! propagates the failure to the dispatcher. Without any error middleware the
//! error always propagates.
//!
//! Nothing here acknowledges implicitly. [`AutoAck`] is an opt-in middleware
//! for applications that want ack-on-success.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;
use tower::BoxError;
use tracing::{Instrument, debug, debug_span, error, warn};
use warren_core::MessageContext;

use crate::handler::ResolvedHandler;
use crate::pipeline::{Middleware, Next, PipelineBuilder, PipelineService};

/// Payload of the single-message chain.
pub type MessageInput = Arc<MessageContext>;

/// Payload of the error-handling chain: the context and the original error.
pub struct Failure {
    /// Context of the failed delivery.
    pub ctx: Arc<MessageContext>,
    /// The error returned by the handler or a middleware.
    pub error: BoxError,
}

impl Failure {
    /// Returns the error, consuming the failure.
    pub fn into_error(self) -> BoxError {
        self.error
    }
}

impl std::fmt::Debug for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Failure")
            .field("delivery_tag", &self.ctx.delivery_tag())
            .field("error", &self.error)
            .finish()
    }
}

// ============================================================================
// MessagePipeline
// ============================================================================

/// A compiled middleware pipeline for one handler registration.
#[derive(Clone)]
pub struct MessagePipeline {
    normal: PipelineService<MessageInput>,
    errors: Option<PipelineService<Failure>>,
}

impl MessagePipeline {
    /// Compiles the chains around `handler`.
    pub fn compile(
        middleware: &PipelineBuilder<MessageInput>,
        error_middleware: &PipelineBuilder<Failure>,
        handler: ResolvedHandler,
    ) -> Self {
        let terminal = tower::service_fn(move |ctx: MessageInput| {
            let instance = handler.instance();
            async move { instance(ctx).await }
        });

        let errors = (!error_middleware.is_empty()).then(|| {
            error_middleware.build(tower::service_fn(|_: Failure| async {
                Ok::<_, BoxError>(())
            }))
        });

        Self {
            normal: middleware.build(terminal),
            errors,
        }
    }

    /// Runs the pipeline for one context.
    ///
    /// # Errors
    ///
    /// Returns the error when the error chain propagates it, or when there is
    /// no error chain at all.
    pub async fn run(&self, ctx: MessageInput) -> Result<(), BoxError> {
        let error = match Next::new(self.normal.clone()).run(Arc::clone(&ctx)).await {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        match &self.errors {
            Some(errors) => Next::new(errors.clone()).run(Failure { ctx, error }).await,
            None => Err(error),
        }
    }
}

impl std::fmt::Debug for MessagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePipeline")
            .field("has_error_chain", &self.errors.is_some())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// AutoAck
// ============================================================================

/// Records a decision when the rest of the pipeline leaves it pending.
///
/// Success acknowledges; failure rejects, or requeues when configured with
/// [`requeue_on_failure`](Self::requeue_on_failure). Decisions already made
/// downstream are never overwritten.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoAck {
    requeue_on_failure: bool,
}

impl AutoAck {
    /// Acks on success and nacks on failure.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requeues instead of nacking on failure.
    pub fn requeue_on_failure(mut self) -> Self {
        self.requeue_on_failure = true;
        self
    }
}

#[async_trait]
impl Middleware<MessageInput> for AutoAck {
    async fn invoke(&self, ctx: MessageInput, next: Next<MessageInput>) -> Result<(), BoxError> {
        let result = next.run(Arc::clone(&ctx)).await;
        if ctx.decision().is_pending() {
            match (&result, self.requeue_on_failure) {
                (Ok(()), _) => ctx.ack(),
                (Err(_), true) => ctx.requeue(),
                (Err(_), false) => ctx.nack(),
            }
        }
        result
    }
}

// ============================================================================
// Tracing
// ============================================================================

/// Wraps the rest of the pipeline in a `handler` span and logs its duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tracing;

#[async_trait]
impl Middleware<MessageInput> for Tracing {
    async fn invoke(&self, ctx: MessageInput, next: Next<MessageInput>) -> Result<(), BoxError> {
        let span = debug_span!(
            "handler",
            routing_key = %ctx.routing_key(),
            delivery_tag = ctx.delivery_tag()
        );
        let start = Instant::now();
        let result = next.run(Arc::clone(&ctx)).instrument(span.clone()).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        span.in_scope(|| match &result {
            Ok(()) => debug!(elapsed_ms, decision = %ctx.decision(), "Handler completed"),
            Err(e) => warn!(elapsed_ms, error = %e, "Handler failed"),
        });
        result
    }
}

// ============================================================================
// Error middleware
// ============================================================================

/// Requeues the failed delivery, then continues down the error chain.
///
/// Reaching the end of the chain swallows the error, so the dispatcher reports
/// success with a requeue decision.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequeueOnError;

#[async_trait]
impl Middleware<Failure> for RequeueOnError {
    async fn invoke(&self, failure: Failure, next: Next<Failure>) -> Result<(), BoxError> {
        debug!(
            delivery_tag = failure.ctx.delivery_tag(),
            error = %failure.error,
            "Requeueing failed delivery"
        );
        failure.ctx.requeue();
        next.run(failure).await
    }
}

/// Logs the failure.
///
/// By default the chain continues (and the error is swallowed at its end).
/// [`LogErrors::propagate`] logs and returns the error instead.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrors {
    propagate: bool,
}

impl LogErrors {
    /// Logs and continues down the error chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs and propagates the error to the dispatcher.
    pub fn propagate() -> Self {
        Self { propagate: true }
    }
}

#[async_trait]
impl Middleware<Failure> for LogErrors {
    async fn invoke(&self, failure: Failure, next: Next<Failure>) -> Result<(), BoxError> {
        error!(
            routing_key = %failure.ctx.routing_key(),
            delivery_tag = failure.ctx.delivery_tag(),
            decision = %failure.ctx.decision(),
            error = %failure.error,
            "Message handler failed"
        );
        if self.propagate {
            return Err(failure.into_error());
        }
        next.run(failure).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::handler::{HandlerFactory, Lifetime};
    use crate::pipeline::{Stage, middleware_fn};
    use warren_core::{AckDecision, Delivery};

    #[derive(Debug, thiserror::Error)]
    #[error("handler exploded")]
    struct Exploded;

    fn ctx() -> MessageInput {
        Arc::new(MessageContext::new(Delivery::new(1, "shop", "orders.created", "{}")))
    }

    fn resolved<H, T>(handler: H) -> ResolvedHandler
    where
        H: crate::handler::Handler<T>,
        T: 'static,
    {
        HandlerFactory::from_handler(Lifetime::Singleton, handler).resolve()
    }

    async fn failing() -> Result<(), Exploded> {
        Err(Exploded)
    }

    fn normal() -> PipelineBuilder<MessageInput> {
        PipelineBuilder::new(Stage::Normal)
    }

    fn errors() -> PipelineBuilder<Failure> {
        PipelineBuilder::new(Stage::Error)
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let handler = move || {
            let flag = Arc::clone(&flag);
            async move { flag.store(true, Ordering::SeqCst) }
        };

        let m2_ran = Arc::new(AtomicBool::new(false));
        let m2_flag = Arc::clone(&m2_ran);
        let middleware = normal()
            .with(
                0,
                middleware_fn(|ctx: MessageInput, _next: Next<MessageInput>| async move {
                    ctx.nack();
                    Ok::<_, BoxError>(())
                }),
            )
            .with(
                1,
                middleware_fn(move |ctx: MessageInput, next: Next<MessageInput>| {
                    let m2_flag = Arc::clone(&m2_flag);
                    async move {
                        m2_flag.store(true, Ordering::SeqCst);
                        next.run(ctx).await
                    }
                }),
            );

        let pipeline = MessagePipeline::compile(&middleware, &errors(), resolved(handler));
        let ctx = ctx();
        pipeline.run(Arc::clone(&ctx)).await.unwrap();

        assert!(!called.load(Ordering::SeqCst));
        assert!(!m2_ran.load(Ordering::SeqCst));
        assert_eq!(ctx.decision(), AckDecision::Nack);
    }

    #[tokio::test]
    async fn test_error_without_error_chain_propagates() {
        let pipeline = MessagePipeline::compile(&normal(), &errors(), resolved(failing));
        let err = pipeline.run(ctx()).await.unwrap_err();
        assert!(err.downcast_ref::<Exploded>().is_some());
    }

    #[tokio::test]
    async fn test_error_chain_sees_original_error_and_swallows() {
        let seen = Arc::new(Mutex::new(None));
        let seen_in = Arc::clone(&seen);
        let error_middleware = errors().with(
            0,
            middleware_fn(move |failure: Failure, next: Next<Failure>| {
                let seen_in = Arc::clone(&seen_in);
                async move {
                    *seen_in.lock().unwrap() = Some(failure.error.downcast_ref::<Exploded>().is_some());
                    next.run(failure).await
                }
            }),
        );

        let pipeline = MessagePipeline::compile(&normal(), &error_middleware, resolved(failing));
        pipeline.run(ctx()).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[tokio::test]
    async fn test_error_chain_can_propagate() {
        let error_middleware = errors().with(0, LogErrors::propagate()).with(1, RequeueOnError);
        let pipeline = MessagePipeline::compile(&normal(), &error_middleware, resolved(failing));

        let ctx = ctx();
        assert!(pipeline.run(Arc::clone(&ctx)).await.is_err());
        // `RequeueOnError` sits after the propagating unit and never runs.
        assert_eq!(ctx.decision(), AckDecision::Pending);
    }

    #[tokio::test]
    async fn test_requeue_on_error() {
        let error_middleware = errors().with(0, LogErrors::new()).with(1, RequeueOnError);
        let pipeline = MessagePipeline::compile(&normal(), &error_middleware, resolved(failing));

        let ctx = ctx();
        pipeline.run(Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.decision(), AckDecision::Requeue);
    }

    #[tokio::test]
    async fn test_middleware_errors_enter_error_chain() {
        async fn ok() {}
        let middleware = normal().with(
            0,
            middleware_fn(|_: MessageInput, _: Next<MessageInput>| async {
                Err::<(), BoxError>("rejected by middleware".into())
            }),
        );
        let error_middleware = errors().with(0, RequeueOnError);
        let pipeline = MessagePipeline::compile(&middleware, &error_middleware, resolved(ok));

        let ctx = ctx();
        pipeline.run(Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.decision(), AckDecision::Requeue);
    }

    #[tokio::test]
    async fn test_no_implicit_ack() {
        async fn ok() {}
        let pipeline = MessagePipeline::compile(&normal(), &errors(), resolved(ok));
        let ctx = ctx();
        pipeline.run(Arc::clone(&ctx)).await.unwrap();
        assert_eq!(ctx.decision(), AckDecision::Pending);
    }

    #[tokio::test]
    async fn test_auto_ack() {
        async fn ok() {}
        async fn explicit(ctx: Arc<MessageContext>) {
            ctx.requeue();
        }

        let middleware = normal().with(0, AutoAck::new()).with(1, Tracing);

        let c = ctx();
        MessagePipeline::compile(&middleware, &errors(), resolved(ok))
            .run(Arc::clone(&c))
            .await
            .unwrap();
        assert_eq!(c.decision(), AckDecision::Ack);

        let c = ctx();
        let _ = MessagePipeline::compile(&middleware, &errors(), resolved(failing))
            .run(Arc::clone(&c))
            .await;
        assert_eq!(c.decision(), AckDecision::Nack);

        let c = ctx();
        MessagePipeline::compile(&middleware, &errors(), resolved(explicit))
            .run(Arc::clone(&c))
            .await
            .unwrap();
        assert_eq!(c.decision(), AckDecision::Requeue);
    }
}
