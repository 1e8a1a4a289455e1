//! Configuration schema definitions.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WarrenConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Single-message consumers, one per queue.
    #[serde(default)]
    pub consumers: Vec<ConsumerConfig>,

    /// Batch consumers, one per queue.
    #[serde(default)]
    pub batch_consumers: Vec<BatchConsumerConfig>,
}

impl WarrenConfig {
    /// Returns the batch consumer configured for `queue_name`.
    pub fn batch_consumer(&self, queue_name: &str) -> Option<&BatchConsumerConfig> {
        self.batch_consumers
            .iter()
            .find(|c| c.queue_name == queue_name)
    }
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Returns the level as used in filter directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    /// Converts to a `tracing` level.
    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Log line format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature.
    #[cfg(feature = "json-log")]
    Json,
}

/// Log destination.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// How often the log file rolls over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Global level.
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Include thread ids.
    #[serde(default)]
    pub thread_ids: bool,

    /// Include file names and line numbers.
    #[serde(default)]
    pub file_location: bool,

    /// Log file, used with `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    /// Roll-over schedule of the log file.
    #[serde(default)]
    pub rotation: LogRotation,

    /// Rolled files kept next to the active one.
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    /// Per-module levels, e.g. `warren_framework = "trace"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            span_events: SpanEventConfig::default(),
            thread_ids: false,
            file_location: false,
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
            filters: HashMap::new(),
        }
    }
}

fn default_max_files() -> u32 {
    5
}

// =============================================================================
// Consumers
// =============================================================================

/// A single-message consumer bound to one queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    /// Queue to consume.
    pub queue_name: String,

    /// Maximum number of unacknowledged deliveries.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,
}

impl ConsumerConfig {
    /// Creates a consumer configuration with the default prefetch.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            prefetch_count: default_prefetch_count(),
        }
    }

    /// Sets the prefetch count.
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }
}

/// A batch consumer bound to one queue.
///
/// Deliveries accumulate for `period_ms` between flushes. The first flush
/// happens `due_time_ms` after start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConsumerConfig {
    /// Queue to consume.
    pub queue_name: String,

    /// Maximum number of unacknowledged deliveries, which also bounds the
    /// size of a batch.
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    /// Time between flushes.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,

    /// Delay before the first flush.
    #[serde(default)]
    pub due_time_ms: u64,

    /// Flush as soon as the buffer holds `prefetch_count` deliveries instead
    /// of waiting for the next tick.
    #[serde(default)]
    pub flush_on_full: bool,
}

impl BatchConsumerConfig {
    /// Creates a batch consumer configuration with default timing.
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            prefetch_count: default_prefetch_count(),
            period_ms: default_period_ms(),
            due_time_ms: 0,
            flush_on_full: false,
        }
    }

    /// Sets the prefetch count.
    pub fn with_prefetch(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Sets the flush period.
    pub fn with_period(mut self, period: Duration) -> Self {
        self.period_ms = period.as_millis() as u64;
        self
    }

    /// Sets the delay before the first flush.
    pub fn with_due_time(mut self, due_time: Duration) -> Self {
        self.due_time_ms = due_time.as_millis() as u64;
        self
    }

    /// Enables early flushing on a full buffer.
    pub fn with_flush_on_full(mut self, flush_on_full: bool) -> Self {
        self.flush_on_full = flush_on_full;
        self
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    pub fn due_time(&self) -> Duration {
        Duration::from_millis(self.due_time_ms)
    }
}

fn default_prefetch_count() -> u16 {
    50
}

fn default_period_ms() -> u64 {
    1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_consumer_defaults_from_partial_input() {
        let config: BatchConsumerConfig =
            serde_json::from_str(r#"{ "queue_name": "audit" }"#).unwrap();
        assert_eq!(config, BatchConsumerConfig::new("audit"));
        assert_eq!(config.period(), Duration::from_secs(1));
        assert_eq!(config.due_time(), Duration::ZERO);
    }

    #[test]
    fn test_log_level_names() {
        let level: LogLevel = serde_json::from_str(r#""warn""#).unwrap();
        assert_eq!(level, LogLevel::Warn);
        assert_eq!(level.to_tracing_level(), tracing::Level::WARN);
    }
}
