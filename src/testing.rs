//! Test doubles shared by the unit tests.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::identifiers::StreamIdentity;
use crate::protocol::Message;
use crate::transport::{ConnectionState, Connector, MessageStream};

/// Installs a test log subscriber once; honours `RUST_LOG`.
pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Identity of a test feed for one ward.
pub(crate) fn feed(ward: &str) -> StreamIdentity {
    StreamIdentity::new("http://feed.test/api")
        .expect("static test url")
        .with_param("ward", ward)
}

/// Waits until `rx` reports `target`, panicking after a generous timeout.
pub(crate) async fn wait_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|state| *state == target))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target}"))
        .unwrap_or_else(|_| panic!("state sender dropped before {target}"));
}

#[derive(Default)]
struct Script {
    refuse_all: bool,
    refuse_next: u32,
    hang: bool,
    attempts: FxHashMap<StreamIdentity, Vec<Instant>>,
    feeds: FxHashMap<StreamIdentity, mpsc::UnboundedSender<Result<Message>>>,
}

/// In-memory connector whose feeds are driven by the test.
#[derive(Default)]
pub(crate) struct ScriptedConnector {
    script: Mutex<Script>,
}

impl ScriptedConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Refuses every connect attempt while set.
    pub(crate) fn refuse_all(&self, refuse: bool) {
        self.script.lock().refuse_all = refuse;
    }

    /// Refuses the next `count` connect attempts.
    pub(crate) fn refuse_next(&self, count: u32) {
        self.script.lock().refuse_next = count;
    }

    /// Makes connect attempts never complete while set.
    pub(crate) fn hang(&self, hang: bool) {
        self.script.lock().hang = hang;
    }

    /// Number of connect attempts made for `identity`.
    pub(crate) fn attempts(&self, identity: &StreamIdentity) -> usize {
        self.script.lock().attempts.get(identity).map_or(0, Vec::len)
    }

    /// Times of every connect attempt for `identity`.
    pub(crate) fn attempt_times(&self, identity: &StreamIdentity) -> Vec<Instant> {
        self.script
            .lock()
            .attempts
            .get(identity)
            .cloned()
            .unwrap_or_default()
    }

    /// Pushes a message on the open feed. Returns `false` if none is open.
    pub(crate) fn push(&self, identity: &StreamIdentity, message: Message) -> bool {
        self.script
            .lock()
            .feeds
            .get(identity)
            .is_some_and(|tx| tx.send(Ok(message)).is_ok())
    }

    /// Pushes a message of the given wire type.
    pub(crate) fn push_kind(&self, identity: &StreamIdentity, kind: &str) -> bool {
        let message = Message::new(kind, json!({ "type": kind }), identity.clone());
        self.push(identity, message)
    }

    /// Ends the open feed as if the server went away.
    pub(crate) fn drop_feed(&self, identity: &StreamIdentity) -> bool {
        self.script.lock().feeds.remove(identity).is_some()
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(&self, identity: &StreamIdentity) -> Result<MessageStream> {
        let outcome = {
            let mut script = self.script.lock();
            script
                .attempts
                .entry(identity.clone())
                .or_default()
                .push(Instant::now());

            if script.hang {
                None
            } else if script.refuse_all || script.refuse_next > 0 {
                script.refuse_next = script.refuse_next.saturating_sub(1);
                Some(Err(Error::connection("refused by script")))
            } else {
                let (tx, rx) = mpsc::unbounded_channel();
                script.feeds.insert(identity.clone(), tx);
                Some(Ok(rx))
            }
        };

        match outcome {
            None => futures_util::future::pending().await,
            Some(Err(e)) => Err(e),
            Some(Ok(rx)) => {
                let messages =
                    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
                Ok(messages.boxed())
            }
        }
    }
}
