//! Configuration module for the Warren runtime.
//!
//! Layered loading (defaults, files, `WARREN_*` environment variables) plus
//! validation of logging and consumer settings.

pub mod error;
pub mod loader;
pub mod schema;
pub mod validation;

pub use error::{ConfigError, ConfigResult};
pub use loader::{ConfigLoader, Profile, load_config, load_config_from_file};
pub use schema::{
    BatchConsumerConfig, ConsumerConfig, LogFormat, LogLevel, LogOutput, LogRotation,
    LoggingConfig, SpanEventConfig, WarrenConfig,
};
pub use validation::{validate_batch_consumer, validate_consumer, validate_config};
