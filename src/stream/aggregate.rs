//! Multi-stream aggregation.
//!
//! An [`AggregateStream`] subscribes to several feeds at once, tags every
//! message with the key of the stream it came from, and merges them into a
//! single feed. Order is preserved per stream only.
//!
//! # Composite State
//!
//! | Member states | Aggregate |
//! |---------------|-----------|
//! | none | `Closed` |
//! | all `Open` | `Open` |
//! | none `Open`, some `Connecting` | `Connecting` |
//! | all `Closed` / `Reclaimed` | `Closed` |
//! | all `Errored` / `Failed` | `Error` |
//! | anything else | `Partial` |
//!
//! Rules are applied top to bottom; the first match wins.

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;

use futures_util::future::{self, select_all};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identifiers::StreamIdentity;
use crate::protocol::Message;
use crate::transport::{ConnectionPool, ConnectionState};

use super::buffer::MessageBuffer;
use super::config::StreamConfig;
use super::consumer::{Delivery, Emitter, StreamConsumer};

// ============================================================================
// StreamDescriptor
// ============================================================================

/// One member of an aggregate.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    /// Tag attached to every message from this stream. Unique per aggregate.
    pub key: String,
    pub identity: StreamIdentity,
    pub config: StreamConfig,
}

impl StreamDescriptor {
    /// Creates a descriptor with the default [`StreamConfig`].
    #[must_use]
    pub fn new(key: impl Into<String>, identity: StreamIdentity) -> Self {
        Self {
            key: key.into(),
            identity,
            config: StreamConfig::default(),
        }
    }

    /// Sets the member's consumer configuration.
    #[inline]
    #[must_use]
    pub fn with_config(mut self, config: StreamConfig) -> Self {
        self.config = config;
        self
    }
}

// ============================================================================
// KeyedMessage
// ============================================================================

/// A message tagged with its stream key.
#[derive(Debug, Clone)]
pub struct KeyedMessage {
    pub key: String,
    pub message: Message,
}

// ============================================================================
// AggregateState
// ============================================================================

/// Health of an aggregate, derived from its members' states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AggregateState {
    Open,
    Connecting,
    Closed,
    Error,
    Partial,
}

impl AggregateState {
    /// Derives the composite state; see the module docs for the rules.
    #[must_use]
    pub fn derive(states: impl IntoIterator<Item = ConnectionState>) -> Self {
        let states: Vec<ConnectionState> = states.into_iter().collect();

        if states.is_empty() {
            return Self::Closed;
        }
        if states.iter().all(|s| *s == ConnectionState::Open) {
            return Self::Open;
        }

        let any_open = states.contains(&ConnectionState::Open);
        if !any_open && states.contains(&ConnectionState::Connecting) {
            return Self::Connecting;
        }
        if states.iter().all(|s| s.is_closed()) {
            return Self::Closed;
        }
        if states.iter().all(|s| s.is_error()) {
            return Self::Error;
        }
        Self::Partial
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Connecting => "connecting",
            Self::Closed => "closed",
            Self::Error => "error",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for AggregateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// AggregateStream
// ============================================================================

struct Member {
    key: String,
    consumer: StreamConsumer,
}

/// Several feeds merged into one keyed feed.
///
/// # Example
///
/// ```no_run
/// use intel_feed::{AggregateStream, ConnectionPool, PoolConfig, StreamDescriptor, StreamIdentity};
///
/// # async fn example() -> intel_feed::Result<()> {
/// let pool = ConnectionPool::new(PoolConfig::new())?;
/// let base = StreamIdentity::new("https://intel.example.org/api")?;
///
/// let mut wards = AggregateStream::compose(
///     &pool,
///     [
///         StreamDescriptor::new("north", base.clone().with_param("ward", "4")),
///         StreamDescriptor::new("south", base.with_param("ward", "12")),
///     ],
/// )?;
///
/// while let Some(keyed) = wards.recv().await {
///     println!("[{}] {}", keyed.key, keyed.message.kind());
/// }
/// # Ok(())
/// # }
/// ```
pub struct AggregateStream {
    pool: Arc<ConnectionPool>,
    members: Vec<Member>,
    merged_rx: mpsc::UnboundedReceiver<KeyedMessage>,
    feed: Arc<Mutex<MessageBuffer<KeyedMessage>>>,
    state_tx: Arc<watch::Sender<AggregateState>>,
    state_rx: watch::Receiver<AggregateState>,
    tracker: Option<JoinHandle<()>>,
}

// ============================================================================
// AggregateStream - Constructor
// ============================================================================

impl AggregateStream {
    /// Subscribes to every described stream.
    ///
    /// The merged feed snapshot keeps as many messages as the members'
    /// buffers combined.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] on a duplicate key or an invalid member config
    /// - [`Error::PoolClosed`] if the pool has shut down
    ///
    /// On error every member subscribed so far is released again.
    pub fn compose(
        pool: &Arc<ConnectionPool>,
        descriptors: impl IntoIterator<Item = StreamDescriptor>,
    ) -> Result<Self> {
        let descriptors: Vec<StreamDescriptor> = descriptors.into_iter().collect();

        let mut seen = FxHashSet::default();
        for descriptor in &descriptors {
            if !seen.insert(descriptor.key.as_str()) {
                return Err(Error::config(format!(
                    "Duplicate stream key '{}'",
                    descriptor.key
                )));
            }
        }

        let capacity = descriptors.iter().map(|d| d.config.buffer_capacity).sum();
        let feed = Arc::new(Mutex::new(MessageBuffer::new(capacity)));
        let (merged_tx, merged_rx) = mpsc::unbounded_channel();

        let mut members = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            let emit = member_emitter(descriptor.key.clone(), merged_tx.clone(), Arc::clone(&feed));
            let consumer =
                StreamConsumer::with_emitter(pool, descriptor.identity, descriptor.config, emit)?;
            members.push(Member {
                key: descriptor.key,
                consumer,
            });
        }

        let initial = AggregateState::derive(members.iter().map(|m| m.consumer.state()));
        let (state_tx, state_rx) = watch::channel(initial);

        let mut aggregate = Self {
            pool: Arc::clone(pool),
            members,
            merged_rx,
            feed,
            state_tx: Arc::new(state_tx),
            state_rx,
            tracker: None,
        };
        aggregate.restart_tracker();

        info!(
            members = aggregate.members.len(),
            state = %initial,
            "Aggregate stream composed"
        );
        Ok(aggregate)
    }
}

// ============================================================================
// AggregateStream - Public API
// ============================================================================

impl AggregateStream {
    /// Returns the composite state.
    #[inline]
    #[must_use]
    pub fn state(&self) -> AggregateState {
        *self.state_rx.borrow()
    }

    /// Returns a receiver that observes composite state changes.
    #[inline]
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<AggregateState> {
        self.state_rx.clone()
    }

    /// Returns each member's state, in composition order.
    #[must_use]
    pub fn states(&self) -> Vec<(String, ConnectionState)> {
        self.members
            .iter()
            .map(|m| (m.key.clone(), m.consumer.state()))
            .collect()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Returns the member subscription for `key`.
    #[must_use]
    pub fn consumer(&self, key: &str) -> Option<&StreamConsumer> {
        self.members.iter().find(|m| m.key == key).map(|m| &m.consumer)
    }

    /// Returns the retained merged feed, oldest first.
    #[must_use]
    pub fn feed(&self) -> Vec<KeyedMessage> {
        self.feed.lock().to_vec()
    }

    /// Waits for the next merged message.
    ///
    /// Returns `None` once every member has stopped and nothing is pending.
    /// Messages from members removed meanwhile are skipped.
    pub async fn recv(&mut self) -> Option<KeyedMessage> {
        let mut watches: Vec<watch::Receiver<ConnectionState>> =
            self.members.iter().map(|m| m.consumer.watch_state()).collect();

        loop {
            let all_stopped = watches.iter().all(|rx| rx.borrow().is_terminal());

            tokio::select! {
                biased;

                keyed = self.merged_rx.recv() => match keyed {
                    Some(keyed) if self.members.iter().any(|m| m.key == keyed.key) => return Some(keyed),
                    Some(_) => continue,
                    None => return None,
                },

                () = any_changed(&mut watches), if !all_stopped => continue,

                () = future::ready(()), if all_stopped => {
                    while let Ok(keyed) = self.merged_rx.try_recv() {
                        if self.members.iter().any(|m| m.key == keyed.key) {
                            return Some(keyed);
                        }
                    }
                    return None;
                }
            }
        }
    }

    /// Unsubscribes one member. Siblings are unaffected.
    ///
    /// Returns `false` if no member has that key.
    pub fn remove(&mut self, key: &str) -> bool {
        let Some(index) = self.members.iter().position(|m| m.key == key) else {
            return false;
        };

        let member = self.members.remove(index);
        member.consumer.unsubscribe();
        self.feed.lock().retain(|keyed| keyed.key != key);
        self.restart_tracker();

        info!(key, remaining = self.members.len(), "Aggregate member removed");
        true
    }

    /// Retries one member; see [`StreamConsumer::retry`].
    ///
    /// # Errors
    ///
    /// - [`Error::SubscriptionClosed`] if no member has that key
    /// - [`Error::PoolClosed`] if the pool has shut down
    pub fn retry(&mut self, key: &str) -> Result<bool> {
        let member = self
            .members
            .iter_mut()
            .find(|m| m.key == key)
            .ok_or(Error::SubscriptionClosed)?;
        member.consumer.retry()
    }

    /// Unsubscribes every member.
    pub fn shutdown(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.abort();
        }

        for member in self.members.drain(..) {
            member.consumer.unsubscribe();
            debug!(key = %member.key, "Aggregate member unsubscribed");
        }

        self.state_tx.send_replace(AggregateState::Closed);
        debug!(pool_connections = self.pool.connection_count(), "Aggregate stream shut down");
    }
}

// ============================================================================
// AggregateStream - Internal
// ============================================================================

impl AggregateStream {
    /// Restarts the task deriving the composite state from current members.
    fn restart_tracker(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            tracker.abort();
        }

        let watches = self.members.iter().map(|m| m.consumer.watch_state()).collect();
        self.tracker = Some(tokio::spawn(track_state(watches, Arc::clone(&self.state_tx))));
    }
}

impl Drop for AggregateStream {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for AggregateStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AggregateStream")
            .field("members", &self.members.iter().map(|m| m.key.as_str()).collect::<Vec<_>>())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Tags a member's deliveries and forwards them to the merged feed.
fn member_emitter(
    key: String,
    merged_tx: mpsc::UnboundedSender<KeyedMessage>,
    feed: Arc<Mutex<MessageBuffer<KeyedMessage>>>,
) -> Emitter {
    Arc::new(move |delivery: Delivery| {
        let mut feed = feed.lock();
        for message in delivery.into_messages() {
            let keyed = KeyedMessage {
                key: key.clone(),
                message,
            };
            feed.push(keyed.clone());
            let _ = merged_tx.send(keyed);
        }
    })
}

/// Resolves when any receiver sees a change. Never resolves for an empty set.
async fn any_changed(watches: &mut [watch::Receiver<ConnectionState>]) {
    if watches.is_empty() {
        return future::pending().await;
    }
    let _ = select_all(watches.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
}

async fn track_state(
    mut watches: Vec<watch::Receiver<ConnectionState>>,
    state_tx: Arc<watch::Sender<AggregateState>>,
) {
    loop {
        let derived = AggregateState::derive(watches.iter_mut().map(|rx| *rx.borrow_and_update()));
        let previous = state_tx.send_replace(derived);
        if previous != derived {
            debug!(from = %previous, to = %derived, "Aggregate state changed");
        }

        if watches.is_empty() {
            return;
        }
        let (changed, _, _) = select_all(watches.iter_mut().map(|rx| Box::pin(rx.changed()))).await;
        if changed.is_err() {
            return;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
