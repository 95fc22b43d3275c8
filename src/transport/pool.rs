//! Connection pool for shared push feeds.
//!
//! Hands out at most one live [`Connection`] per [`StreamIdentity`] and keeps
//! the total bounded. Callers pair every [`ConnectionPool::acquire`] with a
//! [`ConnectionPool::release`]; the pool closes a connection once nothing
//! references it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ ConnectionPool (max_connections = 3)         │
//! │  ┌────────────────────────────────────────┐  │
//! │  │ ward=4  → Connection (refs 2, used t9) │  │
//! │  │ ward=7  → Connection (refs 1, used t4) │  │◄── acquire(ward=9):
//! │  │ ward=12 → Connection (refs 0, used t2) │  │    evict LRU (ward=12)
//! │  └────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! # Release Policy
//!
//! With `linger` zero (the default) the last release closes the connection
//! immediately. With a non-zero linger the idle connection stays pooled,
//! still counting toward `max_connections`, and is closed once the linger
//! period passes without a new acquire. Idle entries are evicted before any
//! referenced one.

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::runtime::Handle;
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{ConnectionId, StreamIdentity};

use super::config::PoolConfig;
use super::connection::{Connection, ConnectionState, ExitHook};
use super::connector::{Connector, FeedConnector};

// ============================================================================
// Types
// ============================================================================

/// One pooled connection with its bookkeeping.
struct PoolEntry {
    connection: Connection,
    /// Outstanding acquires.
    refs: usize,
    /// Pool clock value of the latest acquire.
    last_used: u64,
    /// Pool clock value of the release that left the entry unreferenced.
    idle_since: Option<u64>,
}

#[derive(Default)]
struct PoolInner {
    connections: FxHashMap<StreamIdentity, PoolEntry>,
    /// Logical clock for LRU ordering.
    clock: u64,
}

impl PoolInner {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}

/// What a release did.
enum Released {
    /// The connection is not (or no longer) pooled.
    Stale,
    /// Other holders remain.
    Shared(usize),
    /// Last reference gone, closed now.
    Closed(Connection),
    /// Last reference gone, closing after the linger period.
    Lingering(u64),
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// Bounded, reference-counted set of push connections keyed by identity.
///
/// # Example
///
/// ```no_run
/// use intel_feed::{ConnectionPool, PoolConfig, StreamIdentity};
///
/// # async fn example() -> intel_feed::Result<()> {
/// let pool = ConnectionPool::new(PoolConfig::new().with_max_connections(3))?;
/// let identity = StreamIdentity::new("https://intel.example.org/api")?.with_param("ward", "12");
///
/// let connection = pool.acquire(&identity)?;
/// let again = pool.acquire(&identity)?;
/// assert_eq!(connection.id(), again.id());
///
/// pool.release(&again);
/// pool.release(&connection);
/// # Ok(())
/// # }
/// ```
pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    http: reqwest::Client,
    inner: Mutex<PoolInner>,
    shutdown: AtomicBool,
}

// ============================================================================
// ConnectionPool - Constructor
// ============================================================================

impl ConnectionPool {
    /// Creates a pool that opens feeds with the default [`FeedConnector`].
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `config` is invalid
    /// - [`Error::Request`] if the HTTP client cannot be built
    pub fn new(config: PoolConfig) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder().build()?;
        let connector = Arc::new(FeedConnector::with_client(http.clone()));
        Self::build(config, connector, http)
    }

    /// Creates a pool with a custom connector.
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `config` is invalid
    /// - [`Error::Request`] if the HTTP client cannot be built
    pub fn with_connector(config: PoolConfig, connector: Arc<dyn Connector>) -> Result<Arc<Self>> {
        let http = reqwest::Client::builder().build()?;
        Self::build(config, connector, http)
    }

    fn build(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        http: reqwest::Client,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        info!(
            max_connections = config.max_connections,
            max_reconnect_attempts = config.max_reconnect_attempts,
            linger_ms = config.linger.as_millis() as u64,
            "ConnectionPool created"
        );

        Ok(Arc::new(Self {
            config,
            connector,
            http,
            inner: Mutex::new(PoolInner::default()),
            shutdown: AtomicBool::new(false),
        }))
    }
}

// ============================================================================
// ConnectionPool - Public API
// ============================================================================

impl ConnectionPool {
    /// Returns the pool configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Returns the HTTP client used for request/response calls.
    #[inline]
    #[must_use]
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    /// Returns the number of pooled connections.
    #[inline]
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.lock().connections.len()
    }

    /// Returns `true` if a connection for `identity` is pooled.
    #[inline]
    #[must_use]
    pub fn contains(&self, identity: &StreamIdentity) -> bool {
        self.inner.lock().connections.contains_key(identity)
    }

    /// Returns the outstanding acquire count for `identity`.
    #[must_use]
    pub fn ref_count(&self, identity: &StreamIdentity) -> usize {
        self.inner
            .lock()
            .connections
            .get(identity)
            .map_or(0, |entry| entry.refs)
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) has been called.
    #[inline]
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Returns the shared connection for `identity`, creating it if needed.
    ///
    /// A pooled connection that is open or connecting is reused as is; one
    /// that is backing off after an error is told to reconnect now. When a
    /// new connection is needed and the pool is full, an entry is closed as
    /// [`ConnectionState::Reclaimed`] first: an idle lingering one if there
    /// is any, otherwise the least recently acquired.
    ///
    /// Every successful call must be paired with [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] after shutdown.
    pub fn acquire(self: &Arc<Self>, identity: &StreamIdentity) -> Result<Connection> {
        if self.is_shutdown() {
            return Err(Error::PoolClosed);
        }

        let mut inner = self.inner.lock();
        let now = inner.tick();

        if let Some(entry) = inner.connections.get_mut(identity) {
            let state = entry.connection.state();
            if state.is_live() {
                if state == ConnectionState::Errored {
                    entry.connection.reconnect_now();
                }
                entry.refs += 1;
                entry.last_used = now;
                entry.idle_since = None;
                trace!(identity = %identity, refs = entry.refs, state = %state, "Reusing pooled connection");
                return Ok(entry.connection.clone());
            }
        }

        if let Some(stale) = inner.connections.remove(identity) {
            debug!(
                identity = %identity,
                state = %stale.connection.state(),
                "Replacing finished connection"
            );
        }

        if inner.connections.len() >= self.config.max_connections {
            let lru = inner
                .connections
                .iter()
                .min_by_key(|(_, entry)| (entry.refs > 0, entry.last_used))
                .map(|(key, _)| key.clone());

            if let Some(evicted) = lru.and_then(|key| inner.connections.remove(&key)) {
                evicted.connection.close(ConnectionState::Reclaimed);
                info!(
                    evicted = %evicted.connection.identity(),
                    refs = evicted.refs,
                    "Pool full, reclaimed least recently used connection"
                );
            }
        }

        let connection = Connection::spawn(
            identity.clone(),
            Arc::clone(&self.connector),
            &self.config,
            self.exit_hook(identity),
        );
        inner.connections.insert(
            identity.clone(),
            PoolEntry {
                connection: connection.clone(),
                refs: 1,
                last_used: now,
                idle_since: None,
            },
        );
        drop(inner);

        debug!(identity = %identity, id = %connection.id(), "Connection created");
        Ok(connection)
    }

    /// Returns one reference to `connection`.
    ///
    /// Ignored when the pooled entry for the identity is a different
    /// connection, as happens after eviction or terminal failure.
    pub fn release(self: &Arc<Self>, connection: &Connection) {
        let identity = connection.identity();

        let outcome = {
            let mut inner = self.inner.lock();
            let now = inner.tick();

            match inner.connections.get_mut(identity) {
                Some(entry) if entry.connection.id() == connection.id() => {
                    entry.refs = entry.refs.saturating_sub(1);
                    if entry.refs > 0 {
                        Released::Shared(entry.refs)
                    } else if self.config.linger.is_zero() {
                        inner
                            .connections
                            .remove(identity)
                            .map_or(Released::Stale, |entry| Released::Closed(entry.connection))
                    } else {
                        entry.idle_since = Some(now);
                        Released::Lingering(now)
                    }
                }
                _ => Released::Stale,
            }
        };

        match outcome {
            Released::Stale => {
                debug!(identity = %identity, id = %connection.id(), "Release of connection no longer pooled");
            }
            Released::Shared(refs) => {
                trace!(identity = %identity, refs, "Connection still referenced");
            }
            Released::Closed(connection) => {
                connection.close(ConnectionState::Closed);
                debug!(identity = %identity, "Last reference released, connection closed");
            }
            Released::Lingering(since) => {
                self.schedule_reap(identity.clone(), connection.id(), since);
            }
        }
    }

    /// Closes every connection and refuses further acquires.
    pub fn shutdown(&self) {
        info!("ConnectionPool shutting down");
        self.shutdown.store(true, Ordering::SeqCst);

        let entries: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.connections.drain().collect()
        };

        for (identity, entry) in entries {
            entry.connection.close(ConnectionState::Closed);
            debug!(identity = %identity, refs = entry.refs, "Connection closed during shutdown");
        }

        info!("ConnectionPool shutdown complete");
    }
}

// ============================================================================
// ConnectionPool - Lifecycle
// ============================================================================

impl ConnectionPool {
    /// Hook that drops a terminally failed connection from the pool.
    fn exit_hook(self: &Arc<Self>, identity: &StreamIdentity) -> ExitHook {
        let pool = Arc::downgrade(self);
        let identity = identity.clone();
        Box::new(move |id| {
            if let Some(pool) = pool.upgrade() {
                pool.forget(&identity, id);
            }
        })
    }

    /// Removes the entry for `identity` if it is still connection `id`.
    fn forget(&self, identity: &StreamIdentity, id: ConnectionId) {
        let mut inner = self.inner.lock();
        if inner
            .connections
            .get(identity)
            .is_some_and(|entry| entry.connection.id() == id)
        {
            inner.connections.remove(identity);
            warn!(identity = %identity, id = %id, "Failed connection removed from pool");
        }
    }

    /// Closes an idle entry after the linger period.
    fn schedule_reap(self: &Arc<Self>, identity: StreamIdentity, id: ConnectionId, since: u64) {
        let linger = self.config.linger;
        debug!(identity = %identity, linger_ms = linger.as_millis() as u64, "Connection idle, lingering");

        match Handle::try_current() {
            Ok(handle) => {
                let pool = Arc::downgrade(self);
                handle.spawn(async move {
                    tokio::time::sleep(linger).await;
                    if let Some(pool) = pool.upgrade() {
                        pool.reap_idle(&identity, id, since);
                    }
                });
            }
            Err(_) => self.reap_idle(&identity, id, since),
        }
    }

    /// Closes the entry if it has stayed unreferenced since `since`.
    fn reap_idle(&self, identity: &StreamIdentity, id: ConnectionId, since: u64) {
        let reaped = {
            let mut inner = self.inner.lock();
            let idle = inner.connections.get(identity).is_some_and(|entry| {
                entry.connection.id() == id && entry.refs == 0 && entry.idle_since == Some(since)
            });
            if idle {
                inner.connections.remove(identity)
            } else {
                None
            }
        };

        if let Some(entry) = reaped {
            entry.connection.close(ConnectionState::Closed);
            debug!(identity = %identity, "Linger elapsed, connection closed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
