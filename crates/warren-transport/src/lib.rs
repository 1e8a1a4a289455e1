//! # Warren Transport
//!
//! Broker capability implementations for the Warren message-dispatch
//! framework.
//!
//! ```text
//! ┌──────────────────────┐
//! │  warren-runtime      │  (Consumer, BatchConsumer)
//! ├──────────────────────┤
//! │  warren-core         │  (ChannelFactory, ConsumingChannel, Publisher)
//! ├──────────────────────┤
//! │  warren-transport    │  <- This crate (implementations)
//! └──────────────────────┘
//! ```
//!
//! | Implementation | Description | Use Case |
//! |----------------|-------------|----------|
//! | [`MemoryBroker`] | In-process topic broker | Tests, demos, single-process apps |

pub mod memory;

pub use memory::{MemoryBroker, MemoryChannel};
