//! # Warren Framework
//!
//! Handler composition for the Warren message-dispatch framework.
//!
//! This layer provides:
//! - Route declarations and the handler registry (ordering, duplicate detection)
//! - The [`Handler`] trait for Axum-style parameter extraction
//! - A generic pipeline primitive built on tower, used by both the
//!   single-message middleware chain (with its error chain) and the batch
//!   filter chain
//! - The [`Dispatcher`], which routes deliveries to compiled pipelines
//!
//! ```text
//! Delivery ─▶ Dispatcher::dispatch
//!               │ resolve(routing_key, exchange)
//!               ▼
//!        ┌── per matched handler ─────────────────────────────────┐
//!        │ middleware[0] ▶ … ▶ middleware[n] ▶ handler            │
//!        │        └── on Err ─▶ error[0] ▶ … ▶ error[m] ▶ (no-op) │
//!        └────────────────────────────────────────────────────────┘
//!               │ merged AckDecision
//!               ▼
//!           caller applies ack / nack / requeue
//! ```

pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod route;

pub use dispatcher::{Dispatcher, DispatcherBuilder};
pub use error::{
    DispatchError, DispatchResult, ExtractError, ExtractResult, RegistrationError,
};
pub use extractor::{
    Body, DeliveryTag, Exchange, FromContext, Json, PublisherHandle, Redelivered, RoutingKey, Text,
};
pub use filter::{Batch, BatchHandler, BatchPipeline, BatchPipelineBuilder, DedupFilter, SkipEmpty};
pub use handler::{
    BoxedHandler, Handler, HandlerFactory, IntoHandlerResult, Lifetime, ResolvedHandler,
    into_handler,
};
pub use middleware::{AutoAck, Failure, LogErrors, MessageInput, MessagePipeline, RequeueOnError, Tracing};
pub use pipeline::{
    Middleware, MiddlewareFn, MiddlewareLayer, MiddlewareService, Next, PipelineBuilder,
    PipelineService, Stage, middleware_fn,
};
pub use registry::{HandlerId, HandlerRegistration, HandlerRegistry, validate_registration};
pub use route::{Route, RouteBuilder, on_routes};

pub use tower::BoxError;
