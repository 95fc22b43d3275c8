//! Feed wire protocol.
//!
//! The backend pushes discrete events over `GET <base>/stream`. Each event
//! carries a JSON document whose `type` field is the message discriminant.
//!
//! # Message Types
//!
//! | `type` | Payload | Meaning |
//! |--------|---------|---------|
//! | `content_chunk` | `content` | Incremental piece of a response |
//! | `analysis_complete` | `confidence`, `sources`, `actions` | End of one request cycle |
//! | `error` | `message` | Logical exchange failed (connection may stay up) |
//! | `heartbeat` | none | Keep-alive |
//! | anything else | opaque | Passed through unchanged (`analysis`, `progress`, ...) |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `message` | [`Message`] and its typed view [`ParsedMessage`] |
//! | `sse` | Incremental `text/event-stream` decoder |

// ============================================================================
// Submodules
// ============================================================================

/// Feed message types.
pub mod message;

/// Server-sent events framing.
pub mod sse;

// ============================================================================
// Re-exports
// ============================================================================

pub use message::{Message, MessageKind, ParsedMessage};
pub use sse::{SseDecoder, SseEvent};
