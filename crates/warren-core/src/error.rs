//! Unified error types for the Warren core.
//!
//! This module provides the error types shared by every layer: invalid route
//! patterns and failures reported by the broker collaborator. Framework-level
//! errors (registration, extraction, dispatch) are defined in
//! `warren-framework`.

use thiserror::Error;

// =============================================================================
// Pattern Errors
// =============================================================================

/// Errors raised while parsing a [`RoutePattern`](crate::RoutePattern).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// The pattern string was empty.
    #[error("route pattern cannot be empty")]
    Empty,
}

// =============================================================================
// Broker Errors
// =============================================================================

/// Errors reported by the broker collaborator.
///
/// The core never retries these; they are surfaced to the lifecycle that owns
/// the channel so an outer supervisor can decide what to do.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Opening a consuming channel failed.
    #[error("failed to open channel on queue '{queue}': {reason}")]
    ChannelOpen {
        /// The queue the channel was requested for.
        queue: String,
        /// Reason for failure.
        reason: String,
    },

    /// Registering the consumer on an open channel failed.
    #[error("failed to start consuming from '{queue}': {reason}")]
    Consume {
        /// The queue being consumed.
        queue: String,
        /// Reason for failure.
        reason: String,
    },

    /// An ack/nack for a delivery tag was rejected.
    #[error("failed to acknowledge delivery {delivery_tag}: {reason}")]
    Acknowledge {
        /// The delivery tag.
        delivery_tag: u64,
        /// Reason for failure.
        reason: String,
    },

    /// Publishing a message failed.
    #[error("failed to publish to '{exchange}' with key '{routing_key}': {reason}")]
    Publish {
        /// Target exchange.
        exchange: String,
        /// Routing key of the message.
        routing_key: String,
        /// Reason for failure.
        reason: String,
    },

    /// The channel has already been closed.
    #[error("channel closed")]
    ChannelClosed,
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;
