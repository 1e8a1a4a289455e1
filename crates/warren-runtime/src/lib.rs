//! Warren Runtime - consumers and orchestration for the Warren framework.
//!
//! This crate provides:
//! - The single-message [`Consumer`], which feeds a queue into a
//!   [`Dispatcher`](warren_framework::Dispatcher)
//! - The timer-driven [`BatchConsumer`]
//! - Runtime orchestration ([`WarrenRuntime`])
//! - Layered configuration ([`config`]) and logging setup ([`logging`])
//!
//! ```ignore
//! use warren_runtime::WarrenRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = WarrenRuntime::builder()
//!         .build()?
//!         .with_channel_factory(factory)
//!         .with_dispatcher(dispatcher);
//!
//!     // Run until Ctrl+C
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod consumer;
pub mod error;
pub mod logging;
pub mod runtime;

pub use batch::{BatchConsumer, BatchConsumerBuilder, BatchRoute, EngineState};
pub use config::{
    BatchConsumerConfig, ConfigError, ConfigLoader, ConfigResult, ConsumerConfig, LoggingConfig,
    WarrenConfig,
};
pub use consumer::Consumer;
pub use error::{EngineError, EngineResult, RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{RuntimeBuilder, WarrenRuntime};

// Re-export tracing for use by other crates
pub use tracing;
pub use tracing_subscriber;

/// Logging macros and span helpers.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
