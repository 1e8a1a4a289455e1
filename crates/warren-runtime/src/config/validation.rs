//! Configuration validation utilities.
//!
//! Every check is a pure function of the configuration value, so the same
//! rules run at load time and again when an engine starts.

use std::collections::HashSet;

use super::error::{ConfigError, ConfigResult};
use super::schema::{BatchConsumerConfig, ConsumerConfig, LogOutput, LoggingConfig, WarrenConfig};

/// Validates the entire configuration.
pub fn validate_config(config: &WarrenConfig) -> ConfigResult<()> {
    validate_logging(&config.logging)?;

    let mut seen_queues = HashSet::new();
    for consumer in &config.consumers {
        validate_consumer(consumer)?;
        if !seen_queues.insert(consumer.queue_name.as_str()) {
            return Err(ConfigError::DuplicateQueue(consumer.queue_name.clone()));
        }
    }
    for consumer in &config.batch_consumers {
        validate_batch_consumer(consumer)?;
        if !seen_queues.insert(consumer.queue_name.as_str()) {
            return Err(ConfigError::DuplicateQueue(consumer.queue_name.clone()));
        }
    }

    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    if logging.max_files == 0 {
        return Err(ConfigError::InvalidLogging {
            field: "max_files",
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

/// Validates a single-message consumer.
pub fn validate_consumer(consumer: &ConsumerConfig) -> ConfigResult<()> {
    validate_queue(&consumer.queue_name, consumer.prefetch_count)
}

/// Validates a batch consumer.
pub fn validate_batch_consumer(consumer: &BatchConsumerConfig) -> ConfigResult<()> {
    validate_queue(&consumer.queue_name, consumer.prefetch_count)?;

    if consumer.period_ms == 0 {
        return Err(ConfigError::invalid_queue(
            &consumer.queue_name,
            "batch period must be greater than 0",
        ));
    }

    Ok(())
}

fn validate_queue(queue_name: &str, prefetch_count: u16) -> ConfigResult<()> {
    if queue_name.trim().is_empty() {
        return Err(ConfigError::missing_field("queue_name"));
    }

    if prefetch_count < 1 {
        return Err(ConfigError::invalid_queue(
            queue_name,
            "prefetch count must be at least 1",
        ));
    }

    Ok(())
}
