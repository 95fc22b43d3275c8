//! Push transport layer.
//!
//! This module owns the long-lived feed connections: opening them, keeping
//! them alive with bounded backoff, and sharing one connection between every
//! consumer of the same feed.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  acquire / release  ┌──────────────────┐
//! │  StreamConsumer  │────────────────────►│  ConnectionPool  │
//! │  (one per view)  │                     │  (bounded, LRU)  │
//! └────────▲─────────┘                     └────────┬─────────┘
//!          │ broadcast                              │ spawn
//!          │                               ┌────────▼─────────┐   SSE / WS
//!          └───────────────────────────────│  Connection task │◄──────────── server
//!                                          └──────────────────┘
//! ```
//!
//! # Connection Lifecycle
//!
//! 1. `ConnectionPool::acquire` - Reuse or spawn the connection for a feed
//! 2. `Connector::connect` - Open the transport (bounded by `connect_timeout`)
//! 3. `Connection::subscribe` - Receive messages in arrival order
//! 4. Drop or error - Back off and reconnect until the retry budget is spent
//! 5. `ConnectionPool::release` - Close once the last holder is gone
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `config` | Pool settings and backoff schedule |
//! | `connection` | Connection handle, state machine and event loop |
//! | `connector` | SSE and WebSocket transports |
//! | `pool` | Bounded, reference-counted connection pool |

// ============================================================================
// Submodules
// ============================================================================

/// Pool settings and backoff schedule.
pub mod config;

/// Connection handle and event loop.
pub mod connection;

/// SSE and WebSocket transports.
pub mod connector;

/// Bounded connection pool.
pub mod pool;

// ============================================================================
// Re-exports
// ============================================================================

pub use config::{BackoffSchedule, PoolConfig};
pub use connection::{Connection, ConnectionState};
pub use connector::{Connector, FeedConnector, MessageStream, SseConnector, WsConnector};
pub use pool::ConnectionPool;
