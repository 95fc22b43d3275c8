//! Push transports.
//!
//! A [`Connector`] opens one push channel for a [`StreamIdentity`] and
//! yields its messages as a stream. The stream ending, or yielding an
//! error, means the transport dropped; the owning
//! [`Connection`](super::Connection) decides whether to reconnect.
//!
//! | Connector | Schemes | Framing |
//! |-----------|---------|---------|
//! | [`SseConnector`] | `http`, `https` | `text/event-stream` over `GET` |
//! | [`WsConnector`] | `ws`, `wss` | one text frame per event |
//! | [`FeedConnector`] | all of the above | dispatches on scheme |

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::future;
use futures_util::stream::{self, BoxStream, StreamExt};
use reqwest::header::{ACCEPT, CACHE_CONTROL};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::debug;

use crate::error::{Error, Result};
use crate::identifiers::StreamIdentity;
use crate::protocol::{Message, SseDecoder};

// ============================================================================
// Types
// ============================================================================

/// Messages from one open push channel.
pub type MessageStream = BoxStream<'static, Result<Message>>;

// ============================================================================
// Connector
// ============================================================================

/// Opens push channels.
///
/// Implementations must not retry internally; failures are reported and the
/// pool applies its backoff schedule.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Opens the push channel for `identity`.
    ///
    /// Returns once the channel is established (the open handshake
    /// succeeded), not when the first message arrives.
    async fn connect(&self, identity: &StreamIdentity) -> Result<MessageStream>;
}

// ============================================================================
// SseConnector
// ============================================================================

/// Server-sent events over HTTP.
#[derive(Debug, Clone, Default)]
pub struct SseConnector {
    client: reqwest::Client,
}

impl SseConnector {
    /// Creates a connector with its own HTTP client.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a connector sharing an existing HTTP client.
    #[inline]
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Connector for SseConnector {
    async fn connect(&self, identity: &StreamIdentity) -> Result<MessageStream> {
        let url = identity.stream_url();
        let response = self
            .client
            .get(url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache")
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::http(status.as_u16(), url.as_str()));
        }

        debug!(url = %url, "Event stream opened");

        let state = (
            response.bytes_stream().boxed(),
            SseDecoder::new(),
            VecDeque::new(),
            identity.clone(),
        );

        let messages = stream::unfold(
            state,
            |(mut body, mut decoder, mut pending, identity)| async move {
                loop {
                    if let Some(message) = pending.pop_front() {
                        return Some((Ok(message), (body, decoder, pending, identity)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => {
                            for event in decoder.feed(&chunk) {
                                pending.push_back(Message::from_data(
                                    &identity,
                                    event.event.as_deref(),
                                    &event.data,
                                ));
                            }
                        }
                        Some(Err(e)) => {
                            return Some((Err(Error::from(e)), (body, decoder, pending, identity)));
                        }
                        None => return None,
                    }
                }
            },
        );

        Ok(messages.boxed())
    }
}

// ============================================================================
// WsConnector
// ============================================================================

/// Push-only WebSocket feed; every text frame is one event.
#[derive(Debug, Clone, Copy, Default)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, identity: &StreamIdentity) -> Result<MessageStream> {
        let url = identity.stream_url();
        let (ws_stream, _response) = connect_async(url.as_str()).await?;

        debug!(url = %url, "WebSocket feed opened");

        let identity = identity.clone();
        let messages = ws_stream
            .take_while(|frame| future::ready(!matches!(frame, Ok(WsMessage::Close(_)))))
            .filter_map(move |frame| {
                let message = match frame {
                    Ok(WsMessage::Text(text)) => Some(Ok(Message::from_data(&identity, None, &text))),
                    Ok(_) => None,
                    Err(e) => Some(Err(Error::from(e))),
                };
                future::ready(message)
            });

        Ok(messages.boxed())
    }
}

// ============================================================================
// FeedConnector
// ============================================================================

/// Default connector: SSE for HTTP(S) bases, WebSocket for WS(S) bases.
#[derive(Debug, Clone, Default)]
pub struct FeedConnector {
    sse: SseConnector,
    ws: WsConnector,
}

impl FeedConnector {
    /// Creates a connector whose SSE side shares `client`.
    #[inline]
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            sse: SseConnector::with_client(client),
            ws: WsConnector,
        }
    }
}

#[async_trait]
impl Connector for FeedConnector {
    async fn connect(&self, identity: &StreamIdentity) -> Result<MessageStream> {
        if identity.is_websocket() {
            self.ws.connect(identity).await
        } else {
            self.sse.connect(identity).await
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::SinkExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    use crate::protocol::MessageKind;

    /// Serves one HTTP response on a loopback port and returns the base URL.
    async fn serve_once(response: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = [0u8; 2048];
            let _ = socket.read(&mut request).await;
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{addr}/api")
    }

    #[tokio::test]
    async fn test_sse_connector_decodes_events() {
        let base = serve_once(
            "HTTP/1.1 200 OK\r\n\
             content-type: text/event-stream\r\n\
             connection: close\r\n\
             \r\n\
             data: {\"type\":\"content_chunk\",\"content\":\"Turnout\"}\n\n\
             : keep-alive\n\n\
             event: progress\ndata: {\"percent\":50}\n\n\
             data: not-json\n\n",
        )
        .await;
        let identity = StreamIdentity::new(&base).unwrap().with_param("ward", "4");

        let stream = SseConnector::new().connect(&identity).await.unwrap();
        let messages: Vec<Message> = stream.filter_map(|m| future::ready(m.ok())).collect().await;

        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].kind(), &MessageKind::ContentChunk);
        assert_eq!(messages[0].content(), Some("Turnout"));
        assert!(messages[1].is_kind("progress"));
        assert_eq!(messages[2].kind(), &MessageKind::Raw);
        assert_eq!(messages[2].source(), &identity);
    }

    #[tokio::test]
    async fn test_sse_connector_rejects_error_status() {
        let base = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await;
        let identity = StreamIdentity::new(&base).unwrap();

        let err = match SseConnector::new().connect(&identity).await {
            Ok(_) => panic!("expected an HTTP error"),
            Err(e) => e,
        };
        assert!(matches!(err, Error::Http { status: 503, .. }));
        assert!(err.is_recoverable());
    }

    /// Accepts one WebSocket client, sends `frames`, then closes.
    async fn serve_ws(frames: Vec<WsMessage>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            for frame in frames {
                ws.send(frame).await.unwrap();
            }
            ws.send(WsMessage::Close(None)).await.ok();
        });
        format!("ws://{addr}/api")
    }

    #[tokio::test]
    async fn test_ws_connector_decodes_text_frames() {
        let base = serve_ws(vec![
            WsMessage::text(r#"{"type":"analysis_complete","summary":"done"}"#),
            WsMessage::binary(vec![1u8, 2, 3]),
            WsMessage::Ping(Default::default()),
            WsMessage::text("plain words"),
        ])
        .await;
        let identity = StreamIdentity::new(&base).unwrap().with_param("ward", "4");

        let stream = WsConnector.connect(&identity).await.unwrap();
        let messages: Vec<Message> = stream.filter_map(|m| future::ready(m.ok())).collect().await;

        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].kind(), &MessageKind::AnalysisComplete);
        assert_eq!(messages[1].kind(), &MessageKind::Raw);
        assert_eq!(messages[1].source(), &identity);
    }

    #[tokio::test]
    async fn test_ws_close_ends_stream() {
        let base = serve_ws(Vec::new()).await;
        let identity = StreamIdentity::new(&base).unwrap();

        let mut stream = FeedConnector::default().connect(&identity).await.unwrap();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_ws_handshake_rejected() {
        let base = serve_once(
            "HTTP/1.1 404 Not Found\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
        )
        .await
        .replacen("http", "ws", 1);
        let identity = StreamIdentity::new(&base).unwrap();

        let result = WsConnector.connect(&identity).await;
        tokio_test::assert_err!(result.map(|_| ()));
    }

    #[tokio::test]
    async fn test_connect_refused_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let identity = StreamIdentity::new(&format!("http://{addr}")).unwrap();
        let result = FeedConnector::default().connect(&identity).await;
        tokio_test::assert_err!(result.map(|_| ()));
    }
}
