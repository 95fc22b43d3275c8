//! Pooled push connection and its event loop.
//!
//! Each [`Connection`] spawns one tokio task that owns the transport. The
//! task opens the feed through a [`Connector`], forwards messages to every
//! subscriber, and on failure walks the pool's backoff schedule until the
//! retry budget runs out.
//!
//! # State Machine
//!
//! ```text
//!             ┌──────────── Reconnect command ─────────────┐
//!             ▼                                            │
//!  ──► Connecting ──ok──► Open ──drop──► Errored ──delay───┘
//!          │  ▲                            │
//!          │  └─────────── retry ──────────┘
//!          └─fail─► Errored ── budget exhausted ──► Failed
//!
//!  any live state ── Close command ──► Closed | Reclaimed
//! ```
//!
//! Only the pool issues commands; subscribers observe state and messages.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::identifiers::{ConnectionId, StreamIdentity};
use crate::protocol::Message;

use super::config::{BackoffSchedule, PoolConfig};
use super::connector::{Connector, MessageStream};

// ============================================================================
// Types
// ============================================================================

/// Called once by the event loop when the connection fails terminally.
pub(crate) type ExitHook = Box<dyn FnOnce(ConnectionId) + Send>;

// ============================================================================
// ConnectionState
// ============================================================================

/// Lifecycle state of a pooled connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Connect attempt in flight.
    Connecting,
    /// Feed is open and delivering.
    Open,
    /// Transport dropped; a reconnect is scheduled.
    Errored,
    /// Retry budget exhausted. Not retried automatically.
    Failed,
    /// Closed by the pool to make room for another feed. Not an error.
    Reclaimed,
    /// Closed after release or shutdown.
    Closed,
}

impl ConnectionState {
    /// Returns `true` while the connection may still deliver messages.
    #[inline]
    #[must_use]
    pub const fn is_live(self) -> bool {
        matches!(self, Self::Connecting | Self::Open | Self::Errored)
    }

    /// Returns `true` once the connection has stopped for good.
    #[inline]
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !self.is_live()
    }

    /// Returns `true` for the transient and terminal error states.
    #[inline]
    #[must_use]
    pub const fn is_error(self) -> bool {
        matches!(self, Self::Errored | Self::Failed)
    }

    /// Returns `true` for the closed states.
    #[inline]
    #[must_use]
    pub const fn is_closed(self) -> bool {
        matches!(self, Self::Closed | Self::Reclaimed)
    }

    /// Returns a lowercase label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Errored => "errored",
            Self::Failed => "failed",
            Self::Reclaimed => "reclaimed",
            Self::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// ConnectionCommand
// ============================================================================

/// Internal commands for the event loop.
#[derive(Debug)]
pub(crate) enum ConnectionCommand {
    /// Skip the remaining backoff delay and connect now.
    Reconnect,
    /// Stop the connection, ending in the given terminal state.
    Close(ConnectionState),
}

// ============================================================================
// Connection
// ============================================================================

/// Shared handle to one pooled push connection.
///
/// Cloning is cheap; every clone observes the same event loop. Lifecycle
/// control stays with the [`ConnectionPool`](super::ConnectionPool).
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    identity: StreamIdentity,
    command_tx: mpsc::UnboundedSender<ConnectionCommand>,
    state_rx: watch::Receiver<ConnectionState>,
    message_tx: broadcast::Sender<Message>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("identity", &self.identity.to_string())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Creates a connection in `Connecting` state and spawns its event loop.
    pub(crate) fn spawn(
        identity: StreamIdentity,
        connector: Arc<dyn Connector>,
        config: &PoolConfig,
        on_failed: ExitHook,
    ) -> Self {
        let id = ConnectionId::next();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (message_tx, _) = broadcast::channel(config.channel_capacity);
        let reconnect_attempts = Arc::new(AtomicU32::new(0));

        let event_loop = EventLoop {
            id,
            identity: identity.clone(),
            connector,
            backoff: config.backoff.clone(),
            max_attempts: config.max_reconnect_attempts,
            connect_timeout: config.connect_timeout,
            command_rx,
            state_tx,
            message_tx: message_tx.clone(),
            attempts: Arc::clone(&reconnect_attempts),
        };
        tokio::spawn(event_loop.run(on_failed));

        Self {
            id,
            identity,
            command_tx,
            state_rx,
            message_tx,
            reconnect_attempts,
        }
    }

    /// Returns the connection id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Returns the feed identity.
    #[inline]
    #[must_use]
    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    /// Returns the current state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Returns a receiver that observes every state change.
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Subscribes to messages received from now on, in arrival order.
    #[inline]
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.message_tx.subscribe()
    }

    /// Returns the number of consecutive failed attempts since the last open.
    #[inline]
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    /// Asks the event loop to connect immediately if it is backing off.
    pub(crate) fn reconnect_now(&self) {
        let _ = self.command_tx.send(ConnectionCommand::Reconnect);
    }

    /// Stops the event loop, ending in `state`.
    pub(crate) fn close(&self, state: ConnectionState) {
        debug_assert!(state.is_closed(), "close must end in a closed state");
        let _ = self.command_tx.send(ConnectionCommand::Close(state));
    }
}

// ============================================================================
// EventLoop
// ============================================================================

/// Why the message pump stopped.
enum Pump {
    /// Close command received.
    Closed(ConnectionState),
    /// Transport dropped.
    Dropped(Error),
}

/// Task-side half of a [`Connection`].
struct EventLoop {
    id: ConnectionId,
    identity: StreamIdentity,
    connector: Arc<dyn Connector>,
    backoff: BackoffSchedule,
    max_attempts: u32,
    connect_timeout: Duration,
    command_rx: mpsc::UnboundedReceiver<ConnectionCommand>,
    state_tx: watch::Sender<ConnectionState>,
    message_tx: broadcast::Sender<Message>,
    attempts: Arc<AtomicU32>,
}

impl EventLoop {
    async fn run(mut self, on_failed: ExitHook) {
        let final_state = loop {
            self.set_state(ConnectionState::Connecting);

            let connect_timeout = self.connect_timeout;
            let opened = tokio::select! {
                biased;

                command = self.command_rx.recv() => match command {
                    Some(ConnectionCommand::Reconnect) => continue,
                    Some(ConnectionCommand::Close(state)) => break state,
                    None => break ConnectionState::Closed,
                },

                result = timeout(connect_timeout, self.connector.connect(&self.identity)) => {
                    result.unwrap_or_else(|_| {
                        Err(Error::connection_timeout(connect_timeout.as_millis() as u64))
                    })
                }
            };

            let error = match opened {
                Ok(stream) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.set_state(ConnectionState::Open);
                    info!(id = %self.id, identity = %self.identity, "Feed connection open");

                    match self.pump(stream).await {
                        Pump::Closed(state) => break state,
                        Pump::Dropped(error) => error,
                    }
                }
                Err(error) => error,
            };

            let attempt = self.attempts.load(Ordering::SeqCst);
            if attempt >= self.max_attempts {
                warn!(
                    id = %self.id,
                    identity = %self.identity,
                    error = %error,
                    attempts = attempt,
                    "Retry budget exhausted, abandoning feed"
                );
                break ConnectionState::Failed;
            }

            let delay = self.backoff.delay_for(attempt);
            self.attempts.store(attempt + 1, Ordering::SeqCst);
            self.set_state(ConnectionState::Errored);
            warn!(
                id = %self.id,
                identity = %self.identity,
                error = %error,
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Feed connection dropped, reconnect scheduled"
            );

            if let Some(state) = self.wait(delay).await {
                break state;
            }
        };

        if final_state != ConnectionState::Failed {
            self.attempts.store(0, Ordering::SeqCst);
        }
        self.set_state(final_state);
        debug!(id = %self.id, state = %final_state, "Connection event loop terminated");

        if final_state == ConnectionState::Failed {
            on_failed(self.id);
        }
    }

    /// Forwards messages until the transport drops or a close arrives.
    async fn pump(&mut self, mut stream: MessageStream) -> Pump {
        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => match command {
                    Some(ConnectionCommand::Reconnect) => {}
                    Some(ConnectionCommand::Close(state)) => return Pump::Closed(state),
                    None => return Pump::Closed(ConnectionState::Closed),
                },

                item = stream.next() => match item {
                    Some(Ok(message)) => {
                        trace!(id = %self.id, kind = %message.kind(), "Message received");
                        // No receivers is fine: the message is simply not wanted.
                        let _ = self.message_tx.send(message);
                    }
                    Some(Err(error)) => return Pump::Dropped(error),
                    None => return Pump::Dropped(Error::ConnectionClosed),
                },
            }
        }
    }

    /// Sleeps out a backoff delay. Returns a terminal state if closed meanwhile.
    async fn wait(&mut self, delay: Duration) -> Option<ConnectionState> {
        tokio::select! {
            biased;

            command = self.command_rx.recv() => match command {
                Some(ConnectionCommand::Reconnect) => {
                    debug!(id = %self.id, "Backoff cut short by reconnect request");
                    None
                }
                Some(ConnectionCommand::Close(state)) => Some(state),
                None => Some(ConnectionState::Closed),
            },

            () = tokio::time::sleep(delay) => None,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            trace!(id = %self.id, from = %previous, to = %state, "Connection state changed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
