//! Error types for the Warren framework.

use thiserror::Error;
use tower::BoxError;
use warren_core::{AckDecision, PatternError};

// ============================================================================
// Registration errors
// ============================================================================

/// Errors raised while registering handlers.
///
/// Registration errors are configuration errors: they surface synchronously
/// while the dispatcher is built and reject only the offending registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistrationError {
    /// The same handler is already registered for an overlapping scope and
    /// route with a different order.
    #[error(
        "handler '{handler}' is already registered for {patterns:?} on {scope} with order \
         {existing_order}, refusing order {order}"
    )]
    DuplicateRegistration {
        /// Handler identifier.
        handler: String,
        /// Exchange scope shared by both registrations.
        scope: String,
        /// Route patterns declared by both registrations.
        patterns: Vec<String>,
        /// Order of the registration already present.
        existing_order: i32,
        /// Order of the rejected registration.
        order: i32,
    },

    /// The registration declares no route patterns.
    #[error("handler '{handler}' declares no route patterns")]
    NoPatterns {
        /// Handler identifier.
        handler: String,
    },

    /// A route pattern could not be parsed.
    #[error("invalid route pattern for handler '{handler}': {source}")]
    InvalidPattern {
        /// Handler identifier.
        handler: String,
        /// Underlying parse error.
        #[source]
        source: PatternError,
    },

    /// The exchange scope is the empty string.
    #[error("handler '{handler}' declares an empty exchange name")]
    EmptyExchange {
        /// Handler identifier.
        handler: String,
    },
}

// ============================================================================
// Extraction errors
// ============================================================================

/// Errors that can occur during context extraction.
///
/// An extraction failure fails the handler invocation; the error is routed into
/// the error-handling chain like any other handler error.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The payload is not valid UTF-8.
    #[error("payload is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// The payload could not be deserialized as JSON into the expected type.
    #[error("failed to deserialize payload as '{expected}': {reason}")]
    Json {
        /// Expected type name.
        expected: &'static str,
        /// Deserializer message.
        reason: String,
    },

    /// The handler asked for a publisher but none is configured.
    #[error("no publisher is attached to the dispatcher")]
    MissingPublisher,

    /// Custom extraction error.
    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

// ============================================================================
// Dispatch errors
// ============================================================================

/// Errors returned by [`Dispatcher::dispatch`](crate::Dispatcher::dispatch).
#[derive(Debug, Error)]
pub enum DispatchError {
    /// A handler pipeline failed and no error middleware handled the failure.
    ///
    /// `decision` is the acknowledgment decision the caller should apply. It
    /// stays [`AckDecision::Pending`] if nothing recorded one, in which case the
    /// delivery is left unacknowledged.
    #[error("handler '{handler}' failed: {source}")]
    Handler {
        /// Identifier of the first handler that failed.
        handler: String,
        /// Decision merged across every matched handler.
        decision: AckDecision,
        /// The unhandled error.
        #[source]
        source: BoxError,
    },
}

impl DispatchError {
    /// Returns the acknowledgment decision carried by the error.
    pub fn decision(&self) -> AckDecision {
        match self {
            Self::Handler { decision, .. } => *decision,
        }
    }

    /// Returns the identifier of the failed handler.
    pub fn handler(&self) -> &str {
        match self {
            Self::Handler { handler, .. } => handler,
        }
    }
}

/// Result type for dispatch operations.
pub type DispatchResult<T> = Result<T, DispatchError>;
