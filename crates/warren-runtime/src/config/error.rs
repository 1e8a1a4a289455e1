//! Configuration error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while loading or validating a [`WarrenConfig`](super::WarrenConfig).
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An explicitly requested configuration file does not exist.
    #[error("configuration file {} does not exist", .0.display())]
    FileNotFound(PathBuf),

    /// The file extension has no enabled format feature.
    #[error("unsupported configuration format for {}", .0.display())]
    UnsupportedFormat(PathBuf),

    /// The merged layers do not deserialize into the schema.
    #[error("failed to extract configuration: {0}")]
    Extract(#[from] Box<figment::Error>),

    #[error("missing required configuration field: {field}")]
    MissingField { field: String },

    /// A consumer setting is out of range.
    #[error("invalid settings for queue '{queue}': {reason}")]
    InvalidQueue { queue: String, reason: String },

    #[error("invalid logging setting {field}: {reason}")]
    InvalidLogging { field: &'static str, reason: String },

    /// Two consumers, of either kind, share a queue.
    #[error("queue '{0}' has more than one consumer")]
    DuplicateQueue(String),
}

impl ConfigError {
    pub fn missing_field(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid_queue(queue: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidQueue {
            queue: queue.into(),
            reason: reason.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(error: figment::Error) -> Self {
        Self::Extract(Box::new(error))
    }
}

/// Result type for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;
