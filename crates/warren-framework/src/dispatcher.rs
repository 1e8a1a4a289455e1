//! Message dispatcher for the Warren framework.
//!
//! The [`Dispatcher`] receives deliveries and runs the pipelines of every
//! handler whose route matches. When a delivery is dispatched:
//!
//! 1. Registrations are resolved by exchange scope and routing key, in
//!    ascending order then registration sequence
//! 2. Each matched handler runs its own compiled pipeline with a fresh
//!    [`MessageContext`]
//! 3. Decisions are merged; a failing handler does not stop the others, and the
//!    first unhandled failure is reported together with the merged decision
//!
//! ```rust,ignore
//! use warren_framework::{Dispatcher, on_routes, AutoAck, LogErrors};
//!
//! let dispatcher = Dispatcher::builder()
//!     .middleware(0, AutoAck::new())
//!     .error_middleware(0, LogErrors::new())
//!     .route(on_routes(["orders.#"]).handler(on_order))?
//!     .build();
//!
//! let decision = dispatcher.dispatch(delivery).await?;
//! ```

use std::sync::Arc;

use tracing::{Instrument, debug, debug_span, trace, warn};
use warren_core::{AckDecision, BoxedPublisher, Delivery, MessageContext};

use crate::error::{DispatchError, DispatchResult, RegistrationError};
use crate::handler::HandlerFactory;
use crate::middleware::{Failure, MessageInput, MessagePipeline};
use crate::pipeline::{Middleware, PipelineBuilder, Stage};
use crate::registry::{HandlerRegistration, HandlerRegistry};
use crate::route::Route;

// ============================================================================
// DispatcherBuilder
// ============================================================================

/// Collects routes and middleware, then compiles them into a [`Dispatcher`].
pub struct DispatcherBuilder {
    registry: HandlerRegistry<HandlerFactory>,
    middleware: PipelineBuilder<MessageInput>,
    error_middleware: PipelineBuilder<Failure>,
    publisher: Option<BoxedPublisher>,
    unmatched: AckDecision,
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self {
            registry: HandlerRegistry::new(),
            middleware: PipelineBuilder::new(Stage::Normal),
            error_middleware: PipelineBuilder::new(Stage::Error),
            publisher: None,
            unmatched: AckDecision::Pending,
        }
    }
}

impl DispatcherBuilder {
    /// Registers a route (builder pattern).
    ///
    /// # Errors
    ///
    /// Returns the [`RegistrationError`] describing why the route was rejected.
    pub fn route(mut self, route: Route) -> Result<Self, RegistrationError> {
        self.add_route(route)?;
        Ok(self)
    }

    /// Registers a route.
    ///
    /// # Errors
    ///
    /// Returns the [`RegistrationError`] describing why the route was rejected.
    pub fn add_route(&mut self, route: Route) -> Result<&HandlerRegistration, RegistrationError> {
        let (registration, factory) = route.into_parts()?;
        self.registry.register(registration, factory)
    }

    /// Adds a middleware to every handler pipeline at `order`.
    pub fn middleware(mut self, order: i32, middleware: impl Middleware<MessageInput>) -> Self {
        self.middleware.add(order, middleware);
        self
    }

    /// Adds an error middleware at `order`.
    pub fn error_middleware(mut self, order: i32, middleware: impl Middleware<Failure>) -> Self {
        self.error_middleware.add(order, middleware);
        self
    }

    /// Attaches a publisher to every context.
    pub fn publisher(mut self, publisher: BoxedPublisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Sets the decision returned for deliveries no handler matches.
    ///
    /// Defaults to [`AckDecision::Pending`], which leaves them unacknowledged.
    pub fn unmatched(mut self, decision: AckDecision) -> Self {
        self.unmatched = decision;
        self
    }

    /// Resolves handler factories and compiles one pipeline per route.
    pub fn build(self) -> Dispatcher {
        let Self {
            registry,
            middleware,
            error_middleware,
            publisher,
            unmatched,
        } = self;

        let routes = registry.map(|registration, factory| {
            trace!(handler = %registration.handler, lifetime = ?registration.lifetime, "Compiling pipeline");
            MessagePipeline::compile(&middleware, &error_middleware, factory.resolve())
        });
        debug!(
            routes = routes.len(),
            middleware = middleware.len(),
            error_middleware = error_middleware.len(),
            "Dispatcher built"
        );

        Dispatcher {
            routes,
            publisher,
            unmatched,
        }
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Routes deliveries to compiled handler pipelines.
///
/// Immutable once built; share it behind an `Arc`.
#[derive(Clone)]
pub struct Dispatcher {
    routes: HandlerRegistry<MessagePipeline>,
    publisher: Option<BoxedPublisher>,
    unmatched: AckDecision,
}

impl Dispatcher {
    /// Starts building a dispatcher.
    pub fn builder() -> DispatcherBuilder {
        DispatcherBuilder::default()
    }

    /// Returns the number of registered routes.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    /// Iterates over the registrations in sequence order.
    pub fn registrations(&self) -> impl Iterator<Item = &HandlerRegistration> {
        self.routes.registrations()
    }

    /// Dispatches one delivery and returns the acknowledgment decision.
    ///
    /// Every matched handler runs, even after an earlier one failed.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Handler`] for the first handler whose failure
    /// was not handled by the error chain. The error carries the decision
    /// merged across all matched handlers.
    pub async fn dispatch(&self, delivery: Delivery) -> DispatchResult<AckDecision> {
        let span = debug_span!(
            "dispatch",
            exchange = %delivery.exchange,
            routing_key = %delivery.routing_key,
            delivery_tag = delivery.delivery_tag
        );

        async move {
            let matched = self
                .routes
                .resolve(&delivery.routing_key, &delivery.exchange);
            if matched.is_empty() {
                debug!(decision = %self.unmatched, "No handler matched");
                return Ok(self.unmatched);
            }

            let mut decision = AckDecision::Pending;
            let mut failure: Option<(String, tower::BoxError)> = None;

            for (registration, pipeline) in matched {
                let ctx = Arc::new(self.context_for(delivery.clone()));
                let result = pipeline.run(Arc::clone(&ctx)).await;
                decision = decision.merge(ctx.decision());

                match result {
                    Ok(()) => trace!(handler = %registration.handler, decision = %ctx.decision(), "Handler finished"),
                    Err(source) => {
                        warn!(handler = %registration.handler, error = %source, "Handler failed");
                        if failure.is_none() {
                            failure = Some((registration.handler.to_string(), source));
                        }
                    }
                }
            }

            match failure {
                Some((handler, source)) => Err(DispatchError::Handler {
                    handler,
                    decision,
                    source,
                }),
                None => {
                    debug!(%decision, "Dispatch finished");
                    Ok(decision)
                }
            }
        }
        .instrument(span)
        .await
    }

    fn context_for(&self, delivery: Delivery) -> MessageContext {
        let ctx = MessageContext::new(delivery);
        match &self.publisher {
            Some(publisher) => ctx.with_publisher(Arc::clone(publisher)),
            None => ctx,
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("route_count", &self.routes.len())
            .field("unmatched", &self.unmatched)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use bytes::Bytes;
    use tower::BoxError;
    use warren_core::{BrokerResult, Publisher};

    use super::*;
    use crate::extractor::{PublisherHandle, RoutingKey};
    use crate::handler::Lifetime;
    use crate::middleware::{LogErrors, RequeueOnError};
    use crate::route::on_routes;

    fn delivery(key: &str) -> Delivery {
        Delivery::new(1, "shop", key, "{}")
    }

    #[tokio::test]
    async fn test_dispatch_no_routes() {
        let dispatcher = Dispatcher::builder().build();
        assert_eq!(
            dispatcher.dispatch(delivery("a.b")).await.unwrap(),
            AckDecision::Pending
        );

        let dispatcher = Dispatcher::builder().unmatched(AckDecision::Nack).build();
        assert_eq!(
            dispatcher.dispatch(delivery("a.b")).await.unwrap(),
            AckDecision::Nack
        );
    }

    #[tokio::test]
    async fn test_matched_handlers_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let handler = |name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>| {
            let log = Arc::clone(log);
            move || {
                let log = Arc::clone(&log);
                async move { log.lock().unwrap().push(name) }
            }
        };

        let dispatcher = Dispatcher::builder()
            .route(on_routes(["a.#"]).order(10).named("late").handler(handler("late", &log)))
            .unwrap()
            .route(on_routes(["a.*.c"]).order(1).named("early").handler(handler("early", &log)))
            .unwrap()
            .route(on_routes(["x.y"]).named("miss").handler(handler("miss", &log)))
            .unwrap()
            .build();

        dispatcher.dispatch(delivery("a.b.c")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), ["early", "late"]);
    }

    #[tokio::test]
    async fn test_decisions_merge_across_handlers() {
        let dispatcher = Dispatcher::builder()
            .route(on_routes(["#"]).named("acks").handler(|ctx: Arc<MessageContext>| async move {
                ctx.ack();
            }))
            .unwrap()
            .route(on_routes(["#"]).named("requeues").handler(|ctx: Arc<MessageContext>| async move {
                ctx.requeue();
            }))
            .unwrap()
            .build();

        assert_eq!(
            dispatcher.dispatch(delivery("k")).await.unwrap(),
            AckDecision::Requeue
        );
    }

    #[tokio::test]
    async fn test_failure_reported_after_all_handlers_run() {
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        let dispatcher = Dispatcher::builder()
            .route(on_routes(["#"]).order(0).named("broken").handler(|ctx: Arc<MessageContext>| async move {
                ctx.nack();
                Err::<(), BoxError>("database down".into())
            }))
            .unwrap()
            .route(on_routes(["#"]).order(1).named("after").handler(move || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }))
            .unwrap()
            .build();

        let err = dispatcher.dispatch(delivery("k")).await.unwrap_err();
        assert_eq!(err.handler(), "broken");
        assert_eq!(err.decision(), AckDecision::Nack);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unnamed_closures_are_separate_handlers() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let (first, second) = (Arc::clone(&ran), Arc::clone(&ran));

        let dispatcher = Dispatcher::builder()
            .route(on_routes(["#"]).handler(move || {
                let ran = Arc::clone(&first);
                async move { ran.lock().unwrap().push("first") }
            }))
            .unwrap()
            .route(on_routes(["#"]).handler(move || {
                let ran = Arc::clone(&second);
                async move { ran.lock().unwrap().push("second") }
            }))
            .unwrap()
            .build();

        dispatcher.dispatch(delivery("k")).await.unwrap();
        assert_eq!(*ran.lock().unwrap(), ["first", "second"]);
    }

    #[tokio::test]
    async fn test_unnamed_closures_with_different_orders_register() {
        let ran = Arc::new(Mutex::new(Vec::new()));
        let (late, early) = (Arc::clone(&ran), Arc::clone(&ran));

        let dispatcher = Dispatcher::builder()
            .route(on_routes(["orders.#"]).order(2).handler(move || {
                let ran = Arc::clone(&late);
                async move { ran.lock().unwrap().push("late") }
            }))
            .unwrap()
            .route(on_routes(["orders.#"]).order(1).handler(move || {
                let ran = Arc::clone(&early);
                async move { ran.lock().unwrap().push("early") }
            }))
            .unwrap()
            .build();

        dispatcher.dispatch(delivery("orders.created")).await.unwrap();
        assert_eq!(*ran.lock().unwrap(), ["early", "late"]);
    }

    #[tokio::test]
    async fn test_error_middleware_swallows() {
        let dispatcher = Dispatcher::builder()
            .error_middleware(0, LogErrors::new())
            .error_middleware(1, RequeueOnError)
            .route(on_routes(["#"]).handler(|| async { Err::<(), BoxError>("boom".into()) }))
            .unwrap()
            .build();

        assert_eq!(
            dispatcher.dispatch(delivery("k")).await.unwrap(),
            AckDecision::Requeue
        );
    }

    #[tokio::test]
    async fn test_duplicate_route_rejected() {
        async fn handler() {}

        let result = Dispatcher::builder()
            .route(on_routes(["orders.#"]).exchange("shop").order(1).handler(handler))
            .unwrap()
            .route(on_routes(["orders.#"]).exchange("shop").order(2).handler(handler));
        assert!(matches!(
            result,
            Err(RegistrationError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn test_exchange_scope() {
        let dispatcher = Dispatcher::builder()
            .route(on_routes(["#"]).exchange("billing").handler(|ctx: Arc<MessageContext>| async move {
                ctx.ack();
            }))
            .unwrap()
            .build();

        assert_eq!(
            dispatcher.dispatch(delivery("k")).await.unwrap(),
            AckDecision::Pending
        );
        let billing = Delivery::new(1, "billing", "k", "{}");
        assert_eq!(dispatcher.dispatch(billing).await.unwrap(), AckDecision::Ack);
    }

    #[tokio::test]
    async fn test_transient_factory_called_per_delivery() {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&built);

        let dispatcher = Dispatcher::builder()
            .route(on_routes(["#"]).lifetime(Lifetime::Transient).factory(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                |_: RoutingKey| async {}
            }))
            .unwrap()
            .build();
        assert_eq!(built.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(delivery("a")).await.unwrap();
        dispatcher.dispatch(delivery("b")).await.unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    struct RecordingPublisher(Mutex<Vec<String>>);

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish(&self, exchange: &str, routing_key: &str, _payload: Bytes) -> BrokerResult<()> {
            self.0.lock().unwrap().push(format!("{exchange}/{routing_key}"));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_handler_publishes_follow_up() {
        let publisher = Arc::new(RecordingPublisher(Mutex::new(Vec::new())));

        let dispatcher = Dispatcher::builder()
            .publisher(publisher.clone())
            .route(on_routes(["orders.created"]).handler(|PublisherHandle(p): PublisherHandle| async move {
                p.publish("shop", "orders.audit", Bytes::from_static(b"{}")).await
            }))
            .unwrap()
            .build();

        dispatcher.dispatch(delivery("orders.created")).await.unwrap();
        assert_eq!(*publisher.0.lock().unwrap(), ["shop/orders.audit"]);
    }
}
