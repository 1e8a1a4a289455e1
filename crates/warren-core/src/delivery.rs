//! Deliveries and acknowledgment decisions.

use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// A message delivered by the broker to a consumer.
///
/// Cheap to clone: the payload is reference-counted.
#[derive(Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Exchange the message was published to.
    pub exchange: String,
    /// Routing key the message was published with.
    pub routing_key: String,
    /// Raw message body.
    pub payload: Bytes,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
}

impl Delivery {
    /// Creates a first-time delivery.
    pub fn new(
        delivery_tag: u64,
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            delivery_tag,
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            redelivered: false,
        }
    }

    /// Marks the delivery as redelivered.
    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// The acknowledgment a pipeline has decided on for a delivery.
///
/// Starts as [`Pending`](Self::Pending). Nothing in the pipeline acknowledges
/// implicitly: a delivery whose decision is still pending when processing ends
/// is left unacknowledged and the broker's redelivery rules apply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckDecision {
    /// No decision yet.
    #[default]
    Pending,
    /// Positive acknowledgment.
    Ack,
    /// Reject without requeue.
    Nack,
    /// Reject and ask the broker to redeliver.
    Requeue,
}

impl AckDecision {
    /// Returns `true` while no decision has been recorded.
    pub fn is_pending(self) -> bool {
        self == Self::Pending
    }

    /// Converts the decision into the outcome sent to the broker.
    ///
    /// Returns `None` for [`Pending`](Self::Pending): nothing is sent.
    pub fn outcome(self) -> Option<AckOutcome> {
        match self {
            Self::Pending => None,
            Self::Ack => Some(AckOutcome::Ack),
            Self::Nack => Some(AckOutcome::Nack),
            Self::Requeue => Some(AckOutcome::NackRequeue),
        }
    }

    /// Combines the decisions of several handlers that processed one delivery.
    ///
    /// A requeue beats a reject, a reject beats an ack, and an ack beats
    /// pending.
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }
}

impl PartialOrd for AckDecision {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AckDecision {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        fn rank(d: AckDecision) -> u8 {
            match d {
                AckDecision::Pending => 0,
                AckDecision::Ack => 1,
                AckDecision::Nack => 2,
                AckDecision::Requeue => 3,
            }
        }
        rank(*self).cmp(&rank(*other))
    }
}

impl fmt::Display for AckDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Ack => write!(f, "ack"),
            Self::Nack => write!(f, "nack"),
            Self::Requeue => write!(f, "requeue"),
        }
    }
}

/// What the consumer tells the broker about a delivery tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AckOutcome {
    /// `basic.ack`
    Ack,
    /// `basic.nack` with `requeue = false`
    Nack,
    /// `basic.nack` with `requeue = true`
    NackRequeue,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_has_no_outcome() {
        assert_eq!(AckDecision::Pending.outcome(), None);
        assert_eq!(AckDecision::Requeue.outcome(), Some(AckOutcome::NackRequeue));
    }

    #[test]
    fn test_merge_prefers_negative_decisions() {
        use AckDecision::*;
        assert_eq!(Pending.merge(Ack), Ack);
        assert_eq!(Ack.merge(Nack), Nack);
        assert_eq!(Requeue.merge(Ack), Requeue);
        assert_eq!(Pending.merge(Pending), Pending);
    }
}
