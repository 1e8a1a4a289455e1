//! # Warren
//!
//! Client-side message dispatch for topic-routing brokers.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────┐  Delivery  ┌──────────┐  ┌────────────┐  per matched handler
//! │ Broker │───────────▶│ Consumer │─▶│ Dispatcher │──▶ middleware ▶ handler
//! └────────┘            └──────────┘  └────────────┘       └▶ error chain
//!      │                                                         │
//!      │ Delivery   ┌───────────────┐  tick   ┌──────────┐       ▼
//!      └───────────▶│ BatchConsumer │────────▶│ filters  │▶ batch handler
//!                   └───────────────┘         └──────────┘
//! ```
//!
//! - **Routing**: `*` matches one word, `#` matches zero or more
//! - **Registry**: handlers are ordered by `order`, then registration order;
//!   conflicting duplicate registrations are rejected
//! - **Pipelines**: ordered, short-circuiting middleware with a separate
//!   error chain; batch filters use the same primitive
//! - **Acknowledgment**: explicit; a delivery whose decision is still pending
//!   is left unacknowledged
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use warren::prelude::*;
//!
//! async fn on_created(Json(order): Json<Order>, ctx: Arc<MessageContext>) -> Result<(), BoxError> {
//!     save(order).await?;
//!     ctx.ack();
//!     Ok(())
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let dispatcher = Dispatcher::builder()
//!         .route(on_routes(["orders.*.created"]).exchange("shop").handler(on_created))?
//!         .middleware(0, Tracing)
//!         .error_middleware(0, LogErrors::new())
//!         .build();
//!
//!     let runtime = WarrenRuntime::builder()
//!         .build()?
//!         .with_channel_factory(factory)
//!         .with_dispatcher(dispatcher);
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `memory-broker` *(default)*: the in-process [`transport::MemoryBroker`]
//! - `toml-config` *(default)*, `yaml-config`: configuration file formats
//! - `json-log`: JSON log output

pub use warren_core as core;
pub use warren_framework as framework;
pub use warren_runtime as runtime;
#[cfg(feature = "memory-broker")]
pub use warren_transport as transport;

pub use warren_runtime::tracing;

/// Commonly used types for building consumers.
///
/// ```rust,ignore
/// use warren::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    // Runtime and consumers
    pub use warren_runtime::{
        BatchConsumer, BatchConsumerConfig, Consumer, ConsumerConfig, EngineState, WarrenConfig,
        WarrenRuntime,
    };

    // Registration and dispatch
    pub use warren_framework::{
        BoxError, Dispatcher, HandlerFactory, Lifetime, Route, on_routes,
    };

    // Extractors
    pub use warren_framework::{
        Body, DeliveryTag, Exchange, FromContext, Json, PublisherHandle, Redelivered, RoutingKey,
        Text,
    };

    // Pipelines
    pub use warren_framework::{
        AutoAck, Batch, DedupFilter, Failure, LogErrors, Middleware, Next, RequeueOnError,
        SkipEmpty, Tracing, middleware_fn,
    };

    // Core types
    pub use warren_core::{
        AckDecision, ChannelFactory, ConsumingChannel, Delivery, MessageContext, Publisher,
        RoutePattern,
    };

    #[cfg(feature = "memory-broker")]
    pub use warren_transport::MemoryBroker;
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use warren_runtime::config::{ConfigError, ConfigLoader};

    fn write_toml(name: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("{name}-{}.toml", std::process::id()));
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();
        path
    }

    #[cfg(feature = "toml-config")]
    #[test]
    fn test_toml_config_feature_enables_toml_files() {
        let path = write_toml("warren-facade-enabled");
        let config = ConfigLoader::new().file(&path).without_env().load();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.unwrap().logging.level.as_str(), "debug");
    }

    #[cfg(not(feature = "toml-config"))]
    #[test]
    fn test_toml_files_rejected_without_toml_config() {
        let path = write_toml("warren-facade-disabled");
        let result = ConfigLoader::new().file(&path).without_env().load();
        std::fs::remove_file(&path).unwrap();

        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }
}
