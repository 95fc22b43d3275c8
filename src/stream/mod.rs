//! Feed consumption: per-subscriber views over pooled connections.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `aggregate` | Several feeds merged into one keyed feed |
//! | `buffer` | Bounded FIFO message window |
//! | `config` | Filters, throttle window and buffer size |
//! | `consumer` | One subscription with throttled delivery |

// ============================================================================
// Submodules
// ============================================================================

/// Multi-stream aggregation.
pub mod aggregate;

/// Bounded message window.
pub mod buffer;

/// Consumer configuration.
pub mod config;

/// Stream consumer.
pub mod consumer;

// ============================================================================
// Re-exports
// ============================================================================

pub use aggregate::{AggregateState, AggregateStream, KeyedMessage, StreamDescriptor};
pub use buffer::MessageBuffer;
pub use config::{MessageFilter, StreamConfig};
pub use consumer::{Delivery, StreamConsumer};
