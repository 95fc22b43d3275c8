//! Feed message types.
//!
//! A [`Message`] is built once by the transport from one inbound event and
//! is never mutated afterwards. Consumers read it, filter on its
//! [`MessageKind`], and may ask for a typed [`ParsedMessage`] view.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::identifiers::StreamIdentity;

// ============================================================================
// Constants
// ============================================================================

/// Event name the SSE format assigns when a frame names none.
const DEFAULT_EVENT_NAME: &str = "message";

// ============================================================================
// MessageKind
// ============================================================================

/// Message discriminant taken from the event's `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// `content_chunk`: incremental response text.
    ContentChunk,
    /// `analysis_complete`: terminal payload of one request cycle.
    AnalysisComplete,
    /// `error`: the logical exchange failed.
    Error,
    /// `heartbeat`: keep-alive.
    Heartbeat,
    /// Event data that was not valid JSON, kept as text.
    Raw,
    /// Any other application type (`analysis`, `intelligence`, ...).
    Other(String),
}

impl MessageKind {
    /// Maps a wire `type` string to a kind.
    ///
    /// Never yields [`MessageKind::Raw`], which only marks undecodable data.
    #[must_use]
    pub fn from_type(kind: &str) -> Self {
        match kind {
            "content_chunk" => Self::ContentChunk,
            "analysis_complete" => Self::AnalysisComplete,
            "error" => Self::Error,
            "heartbeat" => Self::Heartbeat,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns the wire `type` string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::ContentChunk => "content_chunk",
            Self::AnalysisComplete => "analysis_complete",
            Self::Error => "error",
            Self::Heartbeat => "heartbeat",
            Self::Raw => "raw",
            Self::Other(kind) => kind,
        }
    }
}

impl From<&str> for MessageKind {
    fn from(kind: &str) -> Self {
        Self::from_type(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Message
// ============================================================================

/// One inbound feed event.
#[derive(Debug, Clone)]
pub struct Message {
    kind: MessageKind,
    payload: Value,
    timestamp: DateTime<Utc>,
    source: StreamIdentity,
}

impl Message {
    /// Creates a message received now.
    #[must_use]
    pub fn new(kind: impl Into<MessageKind>, payload: Value, source: StreamIdentity) -> Self {
        Self {
            kind: kind.into(),
            payload,
            timestamp: Utc::now(),
            source,
        }
    }

    /// Builds a message from raw event data.
    ///
    /// The kind comes from the JSON `type` field, falling back to the SSE
    /// event name. Data that is not JSON becomes a [`MessageKind::Raw`]
    /// message with the text under `content`.
    #[must_use]
    pub fn from_data(source: &StreamIdentity, event_name: Option<&str>, data: &str) -> Self {
        let named = event_name.filter(|name| !name.is_empty() && *name != DEFAULT_EVENT_NAME);

        match serde_json::from_str::<Value>(data) {
            Ok(payload) => {
                let kind = MessageKind::from_type(
                    payload
                        .get("type")
                        .and_then(Value::as_str)
                        .or(named)
                        .unwrap_or(DEFAULT_EVENT_NAME),
                );
                Self::new(kind, payload, source.clone())
            }
            Err(e) => {
                debug!(source = %source, error = %e, "Non-JSON event data kept as raw text");
                Self::new(MessageKind::Raw, json!({ "content": data }), source.clone())
            }
        }
    }

    /// Returns the message kind.
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &MessageKind {
        &self.kind
    }

    /// Returns `true` if the wire type equals `kind`.
    #[inline]
    #[must_use]
    pub fn is_kind(&self, kind: &str) -> bool {
        self.kind.as_str() == kind
    }

    /// Returns the full JSON payload.
    #[inline]
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// Returns the time the message was received.
    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Returns the feed the message arrived on.
    #[inline]
    #[must_use]
    pub fn source(&self) -> &StreamIdentity {
        &self.source
    }

    /// Returns the `content` string field, if any.
    #[inline]
    #[must_use]
    pub fn content(&self) -> Option<&str> {
        self.payload.get("content").and_then(Value::as_str)
    }

    /// Parses the payload into a typed view.
    ///
    /// Known kinds whose payload does not match the expected shape fall back
    /// to [`ParsedMessage::Other`].
    #[must_use]
    pub fn parse(&self) -> ParsedMessage {
        let typed = match self.kind {
            MessageKind::ContentChunk => self
                .payload_as::<ContentChunkPayload>()
                .map(|p| ParsedMessage::ContentChunk { content: p.content }),
            MessageKind::AnalysisComplete => {
                self.payload_as::<AnalysisCompletePayload>()
                    .map(|p| ParsedMessage::AnalysisComplete {
                        content: p.content,
                        confidence: p.confidence,
                        sources: p.sources,
                        actions: p.actions,
                    })
            }
            MessageKind::Error => self
                .payload_as::<ErrorPayload>()
                .map(|p| ParsedMessage::Error { message: p.message }),
            MessageKind::Heartbeat => Some(ParsedMessage::Heartbeat),
            MessageKind::Raw => Some(ParsedMessage::Raw {
                text: self.content().unwrap_or_default().to_string(),
            }),
            MessageKind::Other(_) => None,
        };

        typed.unwrap_or_else(|| ParsedMessage::Other {
            kind: self.kind.as_str().to_string(),
            payload: self.payload.clone(),
        })
    }

    fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        T::deserialize(&self.payload).ok()
    }
}

// ============================================================================
// Payload Shapes
// ============================================================================

#[derive(Deserialize)]
struct ContentChunkPayload {
    content: String,
}

#[derive(Deserialize)]
struct AnalysisCompletePayload {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    sources: Vec<Value>,
    #[serde(default)]
    actions: Vec<Value>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: String,
}

// ============================================================================
// ParsedMessage
// ============================================================================

/// Typed view of a [`Message`].
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedMessage {
    /// Incremental response text.
    ContentChunk {
        /// Text fragment.
        content: String,
    },

    /// End of one analysis cycle.
    AnalysisComplete {
        /// Final response text, when the backend repeats it.
        content: Option<String>,
        /// Confidence score.
        confidence: Option<f64>,
        /// Cited sources.
        sources: Vec<Value>,
        /// Suggested follow-up actions.
        actions: Vec<Value>,
    },

    /// Backend-reported failure of the exchange.
    Error {
        /// Error text.
        message: String,
    },

    /// Keep-alive.
    Heartbeat,

    /// Undecodable event data.
    Raw {
        /// Original text.
        text: String,
    },

    /// Any other application type.
    Other {
        /// Wire type string.
        kind: String,
        /// Full payload.
        payload: Value,
    },
}

// ============================================================================
// Tests
// ============================================================================
