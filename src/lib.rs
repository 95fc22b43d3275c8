//! Intel Feed - Pooled real-time push feeds for intelligence dashboards.
//!
//! This library keeps long-lived server push connections (SSE or WebSocket)
//! to an analysis backend, shares them between every view interested in
//! the same feed, and turns their messages into filtered, throttled
//! deliveries.
//!
//! # Architecture
//!
//! The library is layered around one injected pool:
//!
//! - **Transport**: [`ConnectionPool`] owns at most `max_connections`
//!   [`Connection`]s, one per [`StreamIdentity`], each driven by its own task
//!   with bounded exponential backoff
//! - **Stream**: [`StreamConsumer`] is one subscriber's view (filters, buffer,
//!   throttle); [`AggregateStream`] merges several consumers into one keyed
//!   feed with a composite health state
//!
//! Key design principles:
//!
//! - No global registry: the pool is constructed and passed in
//! - Explicit `acquire` / `release` reference counting
//! - State is observable through `watch` channels, messages through
//!   `broadcast` channels
//! - Capacity eviction is reported as [`ConnectionState::Reclaimed`], not as
//!   an error
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use intel_feed::{ConnectionPool, PoolConfig, Result, StreamConfig, StreamConsumer, StreamIdentity};
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let pool = ConnectionPool::new(PoolConfig::new())?;
//!
//!     let identity = StreamIdentity::new("https://intel.example.org/api")?
//!         .with_param("ward", "12");
//!     let config = StreamConfig::new().with_throttle(Duration::from_millis(200));
//!
//!     let mut consumer = StreamConsumer::subscribe(&pool, identity, config)?;
//!     while let Some(delivery) = consumer.recv().await {
//!         for message in delivery.messages() {
//!             println!("{}: {}", message.kind(), message.payload());
//!         }
//!     }
//!
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`error`] | Error types and [`Result`] alias |
//! | [`identifiers`] | Feed identity and id types |
//! | [`protocol`] | Feed messages and SSE decoding |
//! | [`transport`] | Connections, connectors and the pool |
//! | [`stream`] | Consumers, filters and aggregation |

// ============================================================================
// Modules
// ============================================================================

/// Error types and result aliases.
///
/// All fallible operations return [`Result<T>`] which uses [`Error`].
pub mod error;

/// Feed identity and id types.
pub mod identifiers;

/// Feed message types and wire decoding.
pub mod protocol;

/// Consumers, filters and aggregation.
pub mod stream;

/// Push transport layer.
///
/// Connection pool, per-connection event loop and transports.
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

// ============================================================================
// Re-exports
// ============================================================================

// Error types
pub use error::{Error, Result};

// Identifier types
pub use identifiers::{ConnectionId, StreamIdentity, SubscriptionId};

// Protocol types
pub use protocol::{Message, MessageKind, ParsedMessage, SseDecoder, SseEvent};

// Transport types
pub use transport::{
    BackoffSchedule, Connection, ConnectionPool, ConnectionState, Connector, FeedConnector,
    MessageStream, PoolConfig, SseConnector, WsConnector,
};

// Stream types
pub use stream::{
    AggregateState, AggregateStream, Delivery, KeyedMessage, MessageBuffer, MessageFilter,
    StreamConfig, StreamConsumer, StreamDescriptor,
};
