//! Incremental `text/event-stream` decoder.
//!
//! Bytes arrive in arbitrary chunks; [`SseDecoder::feed`] buffers partial
//! lines and returns every event completed by the chunk. Only the `data`
//! and `event` fields matter to the feed; `id`, `retry` and comment lines
//! (`: keep-alive`) are skipped.

use tracing::warn;

// ============================================================================
// SseEvent
// ============================================================================

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event` field, if sent.
    pub event: Option<String>,
    /// `data` lines joined with `\n`.
    pub data: String,
}

// ============================================================================
// SseDecoder
// ============================================================================

/// Longest line kept before the decoder starts discarding it.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Stateful decoder for one event stream.
///
/// Lines end with `\n`, `\r\n` or a bare `\r`. A line longer than the
/// configured limit is dropped whole.
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    max_line: usize,
    /// The previous byte was a `\r`, so a following `\n` ends nothing.
    after_cr: bool,
    /// Skipping the rest of an oversized line.
    discarding: bool,
    event: Option<String>,
    data: String,
    has_data: bool,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl SseDecoder {
    /// Creates an empty decoder.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a decoder that drops lines longer than `max_line` bytes.
    #[must_use]
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            line: Vec::new(),
            max_line,
            after_cr: false,
            discarding: false,
            event: None,
            data: String::new(),
            has_data: false,
        }
    }

    /// Feeds a chunk and returns the events it completes, in order.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut events = Vec::new();

        for &byte in chunk {
            let after_cr = std::mem::replace(&mut self.after_cr, byte == b'\r');
            match byte {
                b'\n' if after_cr => {}
                b'\r' | b'\n' => self.end_line(&mut events),
                _ if self.discarding => {}
                _ if self.line.len() >= self.max_line => {
                    warn!(limit = self.max_line, "Event stream line too long, discarding");
                    self.line.clear();
                    self.discarding = true;
                }
                _ => self.line.push(byte),
            }
        }

        events
    }

    fn end_line(&mut self, events: &mut Vec<SseEvent>) {
        let line = std::mem::take(&mut self.line);
        if std::mem::take(&mut self.discarding) {
            return;
        }
        self.process_line(&line, events);
    }

    fn process_line(&mut self, line: &[u8], events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.dispatch(events);
            return;
        }
        if line[0] == b':' {
            return;
        }

        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };

        match field {
            "data" => {
                if self.has_data {
                    self.data.push('\n');
                }
                self.data.push_str(value);
                self.has_data = true;
            }
            "event" => self.event = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self, events: &mut Vec<SseEvent>) {
        let event = self.event.take();
        if !self.has_data {
            return;
        }
        self.has_data = false;
        events.push(SseEvent {
            event,
            data: std::mem::take(&mut self.data),
        });
    }
}

// ============================================================================
// Tests
// ============================================================================
