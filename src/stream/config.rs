//! Consumer configuration: filters, throttle window, buffer size.
//!
//! # Filter Semantics
//!
//! | Filters | Message kept when |
//! |---------|-------------------|
//! | none | always |
//! | one or more | at least one filter matches |
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use intel_feed::{MessageFilter, StreamConfig};
//!
//! let config = StreamConfig::new()
//!     .with_filter(MessageFilter::kind("analysis"))
//!     .with_filter(MessageFilter::field("severity", "high"))
//!     .with_throttle(Duration::from_millis(100))
//!     .with_buffer_capacity(50);
//!
//! assert!(config.validate().is_ok());
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::protocol::Message;

// ============================================================================
// Constants
// ============================================================================

/// Default number of messages kept per consumer.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

// ============================================================================
// MessageFilter
// ============================================================================

type Predicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Predicate deciding whether a consumer keeps a message.
#[derive(Clone)]
pub enum MessageFilter {
    /// Matches the message kind (`"analysis"`, `"content_chunk"`, ...).
    Kind(String),
    /// Matches a top-level payload field by equality.
    Field { key: String, value: Value },
    /// Arbitrary predicate.
    Custom(Predicate),
}

impl MessageFilter {
    /// Matches messages of the given kind.
    #[must_use]
    pub fn kind(kind: impl Into<String>) -> Self {
        Self::Kind(kind.into())
    }

    /// Matches messages whose payload has `key == value`.
    #[must_use]
    pub fn field(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Field {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Matches messages accepted by `predicate`.
    #[must_use]
    pub fn custom(predicate: impl Fn(&Message) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(predicate))
    }

    /// Returns `true` if `message` passes this filter.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        match self {
            Self::Kind(kind) => message.is_kind(kind),
            Self::Field { key, value } => message.payload().get(key) == Some(value),
            Self::Custom(predicate) => predicate(message),
        }
    }
}

impl fmt::Debug for MessageFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kind(kind) => f.debug_tuple("Kind").field(kind).finish(),
            Self::Field { key, value } => f
                .debug_struct("Field")
                .field("key", key)
                .field("value", value)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// ============================================================================
// StreamConfig
// ============================================================================

/// Per-consumer settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    /// Message filters; see the module docs for how they combine.
    pub filters: Vec<MessageFilter>,

    /// Delivery coalescing window. Zero delivers every message on its own.
    pub throttle: Duration,

    /// Size of the retained message window.
    pub buffer_capacity: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamConfig {
    /// Creates a configuration with no filters, no throttle and the default
    /// buffer size.
    #[must_use]
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
            throttle: Duration::ZERO,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Adds a filter.
    #[inline]
    #[must_use]
    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the throttle window.
    #[inline]
    #[must_use]
    pub fn with_throttle(mut self, throttle: Duration) -> Self {
        self.throttle = throttle;
        self
    }

    /// Sets the buffer capacity.
    #[inline]
    #[must_use]
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Returns `true` if `message` passes the filter set.
    #[must_use]
    pub fn accepts(&self, message: &Message) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|filter| filter.matches(message))
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the buffer capacity is zero.
    pub fn validate(&self) -> Result<()> {
        if self.buffer_capacity == 0 {
            return Err(Error::config("buffer_capacity must be at least 1"));
        }
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
