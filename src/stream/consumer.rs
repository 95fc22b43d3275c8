//! Stream consumer: one subscriber's view of a pooled feed.
//!
//! A [`StreamConsumer`] acquires the shared connection for its identity and
//! runs an intake task that filters inbound messages, keeps a bounded
//! window of them, and delivers them in throttled batches.
//!
//! # Intake Pipeline
//!
//! ```text
//!  Connection ──broadcast──► filter ──► buffer (FIFO window)
//!                               │
//!                               └──► pending ──throttle──► Delivery ──► recv()
//! ```
//!
//! # Throttling
//!
//! With a non-zero throttle the first message after a flush arms a timer;
//! everything arriving before it fires is delivered as one batch (trailing
//! edge). A zero throttle delivers each message on its own.
//!
//! # Lifecycle
//!
//! | Call | Effect |
//! |------|--------|
//! | `subscribe` | Acquire connection, start intake |
//! | `unsubscribe` / drop | Stop intake, release connection (idempotent) |
//! | `retry` | Re-acquire after a terminal state |

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{StreamIdentity, SubscriptionId};
use crate::protocol::Message;
use crate::transport::{Connection, ConnectionPool, ConnectionState};

use super::buffer::MessageBuffer;
use super::config::StreamConfig;

// ============================================================================
// Types
// ============================================================================

/// Receives every delivery produced by a consumer's intake task.
pub(crate) type Emitter = Arc<dyn Fn(Delivery) + Send + Sync>;

// ============================================================================
// Delivery
// ============================================================================

/// One batch of messages released by the throttle.
#[derive(Debug, Clone)]
pub struct Delivery {
    batch: Vec<Message>,
    flushed_at: Instant,
}

impl Delivery {
    /// Messages in arrival order.
    #[inline]
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.batch
    }

    /// Takes the messages out of the delivery.
    #[inline]
    #[must_use]
    pub fn into_messages(self) -> Vec<Message> {
        self.batch
    }

    /// The newest message in the batch.
    #[inline]
    #[must_use]
    pub fn latest(&self) -> Option<&Message> {
        self.batch.last()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.batch.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    /// When the throttle released this batch.
    #[inline]
    #[must_use]
    pub fn flushed_at(&self) -> Instant {
        self.flushed_at
    }
}

// ============================================================================
// Shared
// ============================================================================

/// State shared between the consumer handle and its intake task.
struct Shared {
    buffer: Mutex<MessageBuffer<Message>>,
    last_flush: Mutex<Option<Instant>>,
    /// Cleared on unsubscribe; nothing is delivered afterwards.
    mounted: AtomicBool,
    state_tx: watch::Sender<ConnectionState>,
}

impl Shared {
    #[inline]
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    /// Publishes `state` unless the consumer has been unsubscribed.
    fn mirror(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if !self.is_mounted() || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }
}

// ============================================================================
// StreamConsumer
// ============================================================================

/// Subscription to one pooled feed.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use intel_feed::{ConnectionPool, MessageFilter, PoolConfig, StreamConfig, StreamConsumer, StreamIdentity};
///
/// # async fn example() -> intel_feed::Result<()> {
/// let pool = ConnectionPool::new(PoolConfig::new())?;
/// let identity = StreamIdentity::new("https://intel.example.org/api")?.with_param("ward", "12");
///
/// let config = StreamConfig::new()
///     .with_filter(MessageFilter::kind("analysis"))
///     .with_throttle(Duration::from_millis(250));
///
/// let mut consumer = StreamConsumer::subscribe(&pool, identity, config)?;
/// while let Some(delivery) = consumer.recv().await {
///     println!("{} new analyses", delivery.len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct StreamConsumer {
    id: SubscriptionId,
    identity: StreamIdentity,
    config: Arc<StreamConfig>,
    pool: Arc<ConnectionPool>,
    connection: Connection,
    shared: Arc<Shared>,
    state_rx: watch::Receiver<ConnectionState>,
    emit: Emitter,
    deliveries: Option<mpsc::UnboundedReceiver<Delivery>>,
    task: JoinHandle<()>,
}

// ============================================================================
// StreamConsumer - Constructor
// ============================================================================

impl StreamConsumer {
    /// Subscribes to `identity` through `pool`.
    ///
    /// Deliveries are read with [`recv`](Self::recv).
    ///
    /// # Errors
    ///
    /// - [`Error::Config`] if `config` is invalid
    /// - [`Error::PoolClosed`] if the pool has shut down
    pub fn subscribe(
        pool: &Arc<ConnectionPool>,
        identity: StreamIdentity,
        config: StreamConfig,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let emit: Emitter = Arc::new(move |delivery| {
            // Receiver gone means the handle is being dropped.
            let _ = tx.send(delivery);
        });

        let mut consumer = Self::with_emitter(pool, identity, config, emit)?;
        consumer.deliveries = Some(rx);
        Ok(consumer)
    }

    /// Subscribes with deliveries routed to `emit` instead of [`recv`](Self::recv).
    pub(crate) fn with_emitter(
        pool: &Arc<ConnectionPool>,
        identity: StreamIdentity,
        config: StreamConfig,
        emit: Emitter,
    ) -> Result<Self> {
        config.validate()?;
        let connection = pool.acquire(&identity)?;

        let (state_tx, state_rx) = watch::channel(connection.state());
        let shared = Arc::new(Shared {
            buffer: Mutex::new(MessageBuffer::new(config.buffer_capacity)),
            last_flush: Mutex::new(None),
            mounted: AtomicBool::new(true),
            state_tx,
        });
        let config = Arc::new(config);
        let task = spawn_intake(&connection, &config, &shared, &emit);

        let id = SubscriptionId::new();
        info!(
            subscription = %id,
            identity = %identity,
            connection = %connection.id(),
            filters = config.filters.len(),
            throttle_ms = config.throttle.as_millis() as u64,
            "Subscribed to feed"
        );

        Ok(Self {
            id,
            identity,
            config,
            pool: Arc::clone(pool),
            connection,
            shared,
            state_rx,
            emit,
            deliveries: None,
            task,
        })
    }
}

// ============================================================================
// StreamConsumer - Accessors
// ============================================================================

impl StreamConsumer {
    #[inline]
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn identity(&self) -> &StreamIdentity {
        &self.identity
    }

    /// Returns the consumer configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &StreamConfig {
        &self.config
    }

    /// Returns the mirrored connection state. `Closed` after unsubscribe.
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

    /// Returns the most recent message that passed the filters.
    #[must_use]
    pub fn latest(&self) -> Option<Message> {
        self.shared.buffer.lock().latest().cloned()
    }

    /// Returns the buffered window, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.shared.buffer.lock().to_vec()
    }

    /// Returns when the last batch was delivered.
    #[must_use]
    pub fn last_flush(&self) -> Option<Instant> {
        *self.shared.last_flush.lock()
    }

    /// Returns `false` once unsubscribed.
    #[inline]
    #[must_use]
    pub fn is_subscribed(&self) -> bool {
        self.shared.is_mounted()
    }
}

// ============================================================================
// StreamConsumer - Delivery
// ============================================================================

impl StreamConsumer {
    /// Waits for the next delivery.
    ///
    /// Returns `None` once unsubscribed, or once the connection reached a
    /// terminal state and every pending delivery has been read. After a
    /// successful [`retry`](Self::retry) deliveries resume.
    pub async fn recv(&mut self) -> Option<Delivery> {
        let mut state = self.state_rx.clone();
        let shared = Arc::clone(&self.shared);
        let rx = self.deliveries.as_mut()?;

        if !shared.is_mounted() {
            return None;
        }

        tokio::select! {
            biased;

            delivery = rx.recv() => delivery.filter(|_| shared.is_mounted()),

            _ = state.wait_for(|s| s.is_terminal()) => {
                rx.try_recv().ok().filter(|_| shared.is_mounted())
            }
        }
    }

    /// Returns a delivery if one is ready.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        if !self.shared.is_mounted() {
            return None;
        }
        self.deliveries.as_mut()?.try_recv().ok()
    }
}

// ============================================================================
// StreamConsumer - Lifecycle
// ============================================================================

impl StreamConsumer {
    /// Stops intake and releases the pooled connection.
    ///
    /// Returns `true` on the first call and `false` afterwards.
    pub fn unsubscribe(&self) -> bool {
        if !self.shared.mounted.swap(false, Ordering::SeqCst) {
            return false;
        }

        self.task.abort();
        self.pool.release(&self.connection);
        self.shared.state_tx.send_replace(ConnectionState::Closed);

        info!(subscription = %self.id, identity = %self.identity, "Unsubscribed from feed");
        true
    }

    /// Re-establishes a subscription whose connection stopped.
    ///
    /// | Connection state | Effect | Returns |
    /// |------------------|--------|---------|
    /// | `Failed`, `Reclaimed`, `Closed` | Re-acquire and restart intake | `true` |
    /// | `Errored` | Skip the remaining backoff delay | `true` |
    /// | `Connecting`, `Open` | Nothing | `false` |
    ///
    /// The buffered window is kept.
    ///
    /// # Errors
    ///
    /// - [`Error::SubscriptionClosed`] after unsubscribe
    /// - [`Error::PoolClosed`] if the pool has shut down
    pub fn retry(&mut self) -> Result<bool> {
        if !self.shared.is_mounted() {
            return Err(Error::SubscriptionClosed);
        }

        let state = self.connection.state();
        match state {
            ConnectionState::Connecting | ConnectionState::Open => Ok(false),
            ConnectionState::Errored => {
                debug!(subscription = %self.id, "Manual retry, reconnecting now");
                self.connection.reconnect_now();
                Ok(true)
            }
            ConnectionState::Failed | ConnectionState::Reclaimed | ConnectionState::Closed => {
                let connection = self.pool.acquire(&self.identity)?;

                self.task.abort();
                self.pool.release(&self.connection);
                self.connection = connection;

                self.shared.mirror(self.connection.state());
                self.task = spawn_intake(&self.connection, &self.config, &self.shared, &self.emit);

                info!(
                    subscription = %self.id,
                    previous = %state,
                    connection = %self.connection.id(),
                    "Manual retry, subscription restarted"
                );
                Ok(true)
            }
        }
    }

    /// Posts `payload` as JSON to the feed's send endpoint.
    ///
    /// Returns the decoded JSON response, or `Value::Null` for an empty body.
    /// Failures are returned as is and never retried.
    ///
    /// # Errors
    ///
    /// - [`Error::Request`] if the request cannot be sent
    /// - [`Error::Http`] for a non-success status
    /// - [`Error::Json`] if the response body is not JSON
    pub async fn send_message<T>(&self, payload: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let url = self.identity.send_url();
        debug!(subscription = %self.id, url = %url, "Sending message");

        let response = self
            .pool
            .http_client()
            .post(url.clone())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(url = %url, status = status.as_u16(), "Send rejected");
            return Err(Error::http(status.as_u16(), url.as_str()));
        }

        let body = response.bytes().await?;
        if body.is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_slice(&body)?)
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

impl std::fmt::Debug for StreamConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConsumer")
            .field("id", &self.id)
            .field("identity", &self.identity.to_string())
            .field("state", &self.state())
            .field("subscribed", &self.is_subscribed())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Intake Task
// ============================================================================

fn spawn_intake(
    connection: &Connection,
    config: &Arc<StreamConfig>,
    shared: &Arc<Shared>,
    emit: &Emitter,
) -> JoinHandle<()> {
    // Subscribe before spawning so nothing published meanwhile is missed.
    let intake = Intake {
        messages: connection.subscribe(),
        state: connection.watch_state(),
        config: Arc::clone(config),
        shared: Arc::clone(shared),
        emit: Arc::clone(emit),
        pending: Vec::new(),
        deadline: None,
    };
    tokio::spawn(intake.run())
}

struct Intake {
    messages: broadcast::Receiver<Message>,
    state: watch::Receiver<ConnectionState>,
    config: Arc<StreamConfig>,
    shared: Arc<Shared>,
    emit: Emitter,
    pending: Vec<Message>,
    /// Throttle flush time while a batch is pending.
    deadline: Option<Instant>,
}

impl Intake {
    async fn run(mut self) {
        let initial = *self.state.borrow_and_update();
        self.shared.mirror(initial);

        loop {
            let deadline = self.deadline;

            tokio::select! {
                biased;

                received = self.messages.recv() => match received {
                    Ok(message) => self.accept(message),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Consumer fell behind, oldest messages dropped");
                    }
                    Err(RecvError::Closed) => {
                        self.finish(ConnectionState::Closed);
                        break;
                    }
                },

                changed = self.state.changed() => {
                    let current = *self.state.borrow_and_update();
                    if changed.is_err() || current.is_terminal() {
                        self.finish(current);
                        break;
                    }
                    self.shared.mirror(current);
                }

                () = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush();
                }
            }
        }
    }

    fn accept(&mut self, message: Message) {
        if !self.config.accepts(&message) {
            trace!(kind = %message.kind(), "Message filtered out");
            return;
        }

        self.shared.buffer.lock().push(message.clone());
        self.pending.push(message);

        if self.config.throttle.is_zero() {
            self.flush();
        } else if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + self.config.throttle);
        }
    }

    fn flush(&mut self) {
        self.deadline = None;
        if self.pending.is_empty() || !self.shared.is_mounted() {
            self.pending.clear();
            return;
        }

        let flushed_at = Instant::now();
        *self.shared.last_flush.lock() = Some(flushed_at);
        let batch = std::mem::take(&mut self.pending);
        trace!(count = batch.len(), "Delivering batch");
        (self.emit)(Delivery { batch, flushed_at });
    }

    /// Delivers what is pending, then publishes the terminal state.
    fn finish(&mut self, state: ConnectionState) {
        self.flush();
        self.shared.mirror(state);
        debug!(state = %state, "Intake stopped");
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    use crate::stream::MessageFilter;
    use crate::testing::{ScriptedConnector, feed, init_tracing, wait_state};
    use crate::transport::PoolConfig;

    fn pool_with(connector: &Arc<ScriptedConnector>, config: PoolConfig) -> Arc<ConnectionPool> {
        ConnectionPool::with_connector(config, connector.clone()).expect("pool creation")
    }

    async fn open(consumer: &StreamConsumer) {
        wait_state(&mut consumer.watch_state(), ConnectionState::Open).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_coalesces_burst_into_one_delivery() {
        init_tracing();
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("12");
        let config = StreamConfig::new().with_throttle(Duration::from_millis(100));

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), config).unwrap();
        open(&consumer).await;

        let start = Instant::now();
        for i in 0..5 {
            connector.push_kind(&identity, &format!("progress-{i}"));
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let delivery = consumer.recv().await.unwrap();
        assert_eq!(delivery.len(), 5);
        assert!(delivery.latest().unwrap().is_kind("progress-4"));
        let waited = delivery.flushed_at() - start;
        assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(150));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(consumer.try_recv().is_none());
        assert_eq!(consumer.last_flush(), Some(delivery.flushed_at()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_throttle_delivers_each_message() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("3");

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), StreamConfig::new()).unwrap();
        open(&consumer).await;

        connector.push_kind(&identity, "heartbeat");
        connector.push_kind(&identity, "analysis");

        assert_eq!(consumer.recv().await.unwrap().len(), 1);
        let second = consumer.recv().await.unwrap();
        assert!(second.latest().unwrap().is_kind("analysis"));
        assert!(consumer.latest().unwrap().is_kind("analysis"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_kind_filter_keeps_only_matching() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("5");
        let config = StreamConfig::new().with_filter(MessageFilter::kind("analysis"));

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), config).unwrap();
        open(&consumer).await;

        for kind in ["content_chunk", "analysis", "content_chunk", "analysis"] {
            connector.push_kind(&identity, kind);
        }

        for _ in 0..2 {
            let delivery = consumer.recv().await.unwrap();
            assert!(delivery.messages().iter().all(|m| m.is_kind("analysis")));
        }

        let kept = consumer.messages();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|m| m.is_kind("analysis")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_buffer_keeps_most_recent_window() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("8");
        let config = StreamConfig::new().with_buffer_capacity(3);

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), config).unwrap();
        open(&consumer).await;

        for i in 0..5 {
            connector.push_kind(&identity, &format!("m{i}"));
        }
        for _ in 0..5 {
            consumer.recv().await.unwrap();
        }

        let kinds: Vec<String> = consumer.messages().iter().map(|m| m.kind().to_string()).collect();
        assert_eq!(kinds, vec!["m2", "m3", "m4"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_is_idempotent_and_releases_once() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("shared");

        let first = StreamConsumer::subscribe(&pool, identity.clone(), StreamConfig::new()).unwrap();
        let second = StreamConsumer::subscribe(&pool, identity.clone(), StreamConfig::new()).unwrap();
        assert_eq!(pool.ref_count(&identity), 2);

        assert!(first.unsubscribe());
        assert!(!first.unsubscribe());
        assert_eq!(pool.ref_count(&identity), 1);
        assert_eq!(first.state(), ConnectionState::Closed);
        assert!(!first.is_subscribed());

        drop(first);
        assert_eq!(pool.ref_count(&identity), 1);

        drop(second);
        assert!(!pool.contains(&identity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delivery_after_unsubscribe() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());
        let identity = feed("quiet");
        let keeper = pool.acquire(&identity).unwrap();
        let config = StreamConfig::new().with_throttle(Duration::from_millis(50));

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), config).unwrap();
        open(&consumer).await;

        connector.push_kind(&identity, "analysis");
        tokio::time::sleep(Duration::from_millis(10)).await;
        consumer.unsubscribe();
        connector.push_kind(&identity, "analysis");
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(consumer.try_recv().is_none());
        assert!(consumer.recv().await.is_none());
        assert_eq!(keeper.state(), ConnectionState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_eviction_is_mirrored_and_retry_recovers() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new().with_max_connections(1));
        let identity = feed("A");

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), StreamConfig::new()).unwrap();
        open(&consumer).await;

        let other = pool.acquire(&feed("B")).unwrap();
        wait_state(&mut consumer.watch_state(), ConnectionState::Reclaimed).await;
        assert!(consumer.recv().await.is_none());

        assert!(consumer.retry().unwrap());
        open(&consumer).await;
        wait_state(&mut other.watch_state(), ConnectionState::Reclaimed).await;

        connector.push_kind(&identity, "analysis");
        assert!(consumer.recv().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_failure() {
        let connector = ScriptedConnector::new();
        connector.refuse_all(true);
        let pool = pool_with(&connector, PoolConfig::new().with_max_reconnect_attempts(1));
        let identity = feed("down");

        let mut consumer = StreamConsumer::subscribe(&pool, identity.clone(), StreamConfig::new()).unwrap();
        wait_state(&mut consumer.watch_state(), ConnectionState::Failed).await;

        // Still refused: the retried connection fails again.
        assert!(consumer.retry().unwrap());
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(consumer.state(), ConnectionState::Failed);

        connector.refuse_all(false);
        assert!(consumer.retry().unwrap());
        open(&consumer).await;
        assert!(!consumer.retry().unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_unsubscribe_fails() {
        let connector = ScriptedConnector::new();
        let pool = pool_with(&connector, PoolConfig::new());

        let mut consumer = StreamConsumer::subscribe(&pool, feed("x"), StreamConfig::new()).unwrap();
        consumer.unsubscribe();
        assert!(matches!(consumer.retry(), Err(Error::SubscriptionClosed)));
    }

    #[tokio::test]
    async fn test_subscribe_rejects_invalid_config() {
        let pool = pool_with(&ScriptedConnector::new(), PoolConfig::new());
        let result = StreamConsumer::subscribe(&pool, feed("x"), StreamConfig::new().with_buffer_capacity(0));
        assert!(matches!(result, Err(Error::Config { .. })));
        assert_eq!(pool.connection_count(), 0);
    }

    /// Serves one HTTP response and reports the request line.
    async fn serve_once(response: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 4096];
            let n = socket.read(&mut request).await.unwrap_or(0);
            let head = String::from_utf8_lossy(&request[..n]).into_owned();
            let _ = tx.send(head.lines().next().unwrap_or_default().to_string());
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        (format!("http://{addr}/api"), rx)
    }

    #[tokio::test]
    async fn test_send_message_posts_to_send_endpoint() -> anyhow::Result<()> {
        let (base, request_line) = serve_once(
            "HTTP/1.1 200 OK\r\n\
             content-type: application/json\r\n\
             content-length: 11\r\n\
             connection: close\r\n\
             \r\n\
             {\"ok\":true}",
        )
        .await;
        let pool = pool_with(&ScriptedConnector::new(), PoolConfig::new());
        let identity = StreamIdentity::new(&base)?.with_param("ward", "12");
        let consumer = StreamConsumer::subscribe(&pool, identity, StreamConfig::new())?;

        let reply = consumer.send_message(&json!({ "query": "turnout" })).await?;

        assert_eq!(reply, json!({ "ok": true }));
        assert_eq!(request_line.await?, "POST /api/send HTTP/1.1");
        Ok(())
    }

    #[tokio::test]
    async fn test_send_message_reports_http_error() -> anyhow::Result<()> {
        let (base, _) = serve_once(
            "HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let pool = pool_with(&ScriptedConnector::new(), PoolConfig::new());
        let consumer = StreamConsumer::subscribe(&pool, StreamIdentity::new(&base)?, StreamConfig::new())?;

        let err = consumer.send_message(&json!({})).await.unwrap_err();
        assert!(matches!(err, Error::Http { status: 500, .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_send_message_empty_body_is_null() -> anyhow::Result<()> {
        let (base, _) = serve_once("HTTP/1.1 204 No Content\r\nconnection: close\r\n\r\n").await;
        let pool = pool_with(&ScriptedConnector::new(), PoolConfig::new());
        let consumer = StreamConsumer::subscribe(&pool, StreamIdentity::new(&base)?, StreamConfig::new())?;

        assert_eq!(consumer.send_message(&json!({ "ping": 1 })).await?, Value::Null);
        Ok(())
    }
}
