//! # Warren Core
//!
//! The core building blocks of the Warren message-dispatch framework.
//!
//! This crate holds everything that has no opinion about how handlers are
//! composed:
//!
//! - **Routing**: topic-style [`RoutePattern`]s and the [`match_patterns`] matcher
//! - **Deliveries**: [`Delivery`], [`AckDecision`], [`AckOutcome`]
//! - **Context**: the per-delivery [`MessageContext`]
//! - **Broker capabilities**: [`ChannelFactory`], [`ConsumingChannel`], [`Publisher`]
//!
//! ```text
//! ┌──────────┐   Delivery   ┌────────────┐   Arc<MessageContext>   ┌──────────┐
//! │  Broker  │─────────────▶│ Dispatcher │────────────────────────▶│ Pipeline │
//! └──────────┘              └────────────┘                          └──────────┘
//! ```

pub mod broker;
pub mod context;
pub mod delivery;
pub mod error;
pub mod routing;

pub use broker::{
    BoxedChannelFactory, BoxedPublisher, ChannelFactory, ConsumingChannel, DeliveryCallback,
    Publisher,
};
pub use context::MessageContext;
pub use delivery::{AckDecision, AckOutcome, Delivery};
pub use error::{BrokerError, BrokerResult, PatternError};
pub use routing::{PatternSegment, RoutePattern, match_patterns};

/// Prelude for common imports.
pub mod prelude {
    pub use super::{
        AckDecision, AckOutcome, ChannelFactory, ConsumingChannel, Delivery, MessageContext,
        Publisher, RoutePattern,
    };
}
