//! Runtime error types.

use std::any::Any;

use thiserror::Error;
use warren_core::BrokerError;

use crate::config::ConfigError;

/// Errors from a consumer or batch engine lifecycle.
#[derive(Error, Debug)]
pub enum EngineError {
    /// The engine configuration is invalid. Raised before any channel opens.
    #[error("Invalid consumer configuration: {0}")]
    Config(#[from] ConfigError),

    /// The broker refused an operation.
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    /// The engine was disposed and cannot be started again.
    #[error("Consumer for queue '{queue}' has been disposed")]
    Disposed { queue: String },
}

/// Result type for engine lifecycle operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors that can occur during runtime operations.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A consumer failed to start or stop.
    #[error("Consumer for queue '{queue}' failed: {source}")]
    Engine {
        queue: String,
        #[source]
        source: EngineError,
    },

    /// Two batch handlers were registered for one queue.
    #[error("A batch handler is already registered for queue '{0}'")]
    DuplicateBatchHandler(String),

    /// The runtime was started without a dispatcher while single-message
    /// consumers are configured.
    #[error("Consumers are configured but no dispatcher was set")]
    MissingDispatcher,

    /// The runtime was started without a channel factory.
    #[error("No channel factory was set")]
    MissingChannelFactory,

    #[error("Failed to listen for shutdown signal: {0}")]
    Signal(#[from] std::io::Error),
}

impl RuntimeError {
    pub(crate) fn engine(queue: impl Into<String>, source: EngineError) -> Self {
        Self::Engine {
            queue: queue.into(),
            source,
        }
    }
}

/// Result type for runtime operations.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Describes a caught handler panic.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".to_string());
    format!("handler panicked: {message}")
}
