//! WebSocket transport implementation using `tokio-tungstenite`.
//!
//! This module provides [`WebSocketTransport`], a [`Transport`]
//! implementation that communicates over a WebSocket connection, and
//! [`WebSocketConnector`], the matching [`Connector`] the socket uses to
//! establish a fresh connection on every (re)connect. Both `ws://` and
//! `wss://` URLs are supported — TLS is handled transparently via
//! [`MaybeTlsStream`](tokio_tungstenite::MaybeTlsStream).
//!
//! # Feature gate
//!
//! This module is only available when the `transport-websocket` feature is
//! enabled (it is enabled by default).

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message;
use url::Url;

use crate::error::PhoenixError;
use crate::transport::{Connector, Frame, Transport};

/// Type alias for the underlying WebSocket stream.
///
/// Made public so that callers can construct a [`WebSocketTransport`] from an
/// existing stream via [`WebSocketTransport::from_stream`].
pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// A [`Transport`] implementation backed by a WebSocket connection.
///
/// Wraps a `tokio-tungstenite` [`WebSocketStream`](tokio_tungstenite::WebSocketStream)
/// and translates between protocol frames and WebSocket frames.
///
/// # Cancel Safety
///
/// The [`recv`](Transport::recv) method is cancel-safe. Dropping the future
/// returned by `recv` before it completes will not consume or lose any
/// frames, making it safe to use inside `tokio::select!`.
#[derive(Debug)]
pub struct WebSocketTransport {
    stream: WsStream,
    closed: bool,
    peer_close_code: Option<u16>,
}

impl WebSocketTransport {
    /// Establish a new WebSocket connection to the given URL, sending the
    /// given headers with the HTTP upgrade request.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::Connect`] if a header is malformed or the
    /// connection cannot be established. When the underlying error is an I/O
    /// error its [`ErrorKind`](std::io::ErrorKind) is preserved via
    /// [`PhoenixError::Io`].
    pub async fn connect(url: &Url, headers: &[(String, String)]) -> Result<Self, PhoenixError> {
        tracing::debug!(url = %url, "connecting to WebSocket server");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| PhoenixError::Connect(e.to_string()))?;
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| PhoenixError::Connect(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| PhoenixError::Connect(format!("invalid header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _response) =
            tokio_tungstenite::connect_async(request)
                .await
                .map_err(|e| match e {
                    tokio_tungstenite::tungstenite::Error::Io(io) => PhoenixError::Io(io),
                    other => PhoenixError::Connect(other.to_string()),
                })?;

        tracing::debug!(url = %url, "WebSocket connection established");

        Ok(Self::from_stream(stream))
    }

    /// Create a [`WebSocketTransport`] from an already-established WebSocket
    /// stream.
    ///
    /// This is useful when you need custom TLS configuration, a proxy, or any
    /// other connection setup that [`connect`](Self::connect) does not expose.
    pub fn from_stream(stream: WsStream) -> Self {
        Self {
            stream,
            closed: false,
            peer_close_code: None,
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), PhoenixError> {
        if self.closed {
            return Err(PhoenixError::TransportClosed);
        }
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| PhoenixError::TransportSend(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, PhoenixError>> {
        loop {
            let msg = match self.stream.next().await {
                Some(Ok(msg)) => msg,
                Some(Err(e)) => {
                    return Some(Err(PhoenixError::TransportReceive(e.to_string())));
                }
                None => return None,
            };

            match msg {
                Message::Text(text) => return Some(Ok(Frame::Text(text.to_string()))),
                Message::Binary(data) => return Some(Ok(Frame::Binary(data.to_vec()))),
                Message::Close(frame) => {
                    tracing::debug!(?frame, "received WebSocket close frame");
                    self.peer_close_code = frame.map(|f| u16::from(f.code));
                    return None;
                }
                Message::Ping(_) | Message::Pong(_) => {
                    // tungstenite auto-queues the pong reply; nothing to do.
                }
                Message::Frame(_) => {
                    // Never produced by the read half; kept for exhaustiveness.
                    tracing::debug!("received raw WebSocket frame, skipping");
                }
            }
        }
    }

    async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), PhoenixError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: reason.unwrap_or_default().into(),
        };
        self.stream
            .close(Some(frame))
            .await
            .map_err(|e| PhoenixError::TransportSend(e.to_string()))
    }

    fn close_code(&self) -> Option<u16> {
        self.peer_close_code
    }
}

/// The default [`Connector`]: opens a [`WebSocketTransport`] per attempt.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Transport>, PhoenixError> {
        let transport = WebSocketTransport::connect(url, headers).await?;
        Ok(Box::new(transport))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn url(raw: &str) -> Url {
        Url::parse(raw).unwrap()
    }

    #[test]
    fn websocket_transport_is_send() {
        fn assert_send<T: Send>() {}
        assert_send::<WebSocketTransport>();
    }

    #[tokio::test]
    async fn connect_fails_with_unreachable_host() {
        let result = WebSocketTransport::connect(&url("ws://127.0.0.1:1"), &[]).await;
        let err = result.unwrap_err();
        assert!(matches!(err, PhoenixError::Io(_)));
    }

    #[tokio::test]
    async fn connect_rejects_malformed_headers() {
        let headers = vec![("bad header name".to_string(), "v".to_string())];
        let result = WebSocketTransport::connect(&url("ws://127.0.0.1:1"), &headers).await;
        assert!(matches!(result.unwrap_err(), PhoenixError::Connect(_)));
    }

    // ── Mock-server helpers ──────────────────────────────────────────

    /// Start a local WebSocket server that runs `handler` on the accepted
    /// connection and returns the URL to connect to.
    async fn start_mock_server<F, Fut>(handler: F) -> Url
    where
        F: FnOnce(tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>) -> Fut
            + Send
            + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            handler(ws).await;
        });

        url(&format!("ws://{addr}"))
    }

    // ── Mock-server tests ────────────────────────────────────────────

    #[tokio::test]
    async fn recv_receives_text_and_binary_frames() {
        let server = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.send(Message::Binary(vec![1, 2, 3].into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&server, &[]).await.unwrap();

        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Text("hello".into()));

        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Binary(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn recv_returns_none_and_records_code_on_close_frame() {
        let server = start_mock_server(|mut ws| async move {
            ws.close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "done".into(),
            }))
            .await
            .unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&server, &[]).await.unwrap();
        assert!(transport.recv().await.is_none());
        assert_eq!(transport.close_code(), Some(1000));
    }

    #[tokio::test]
    async fn send_after_close_returns_transport_closed() {
        let server = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&server, &[]).await.unwrap();
        transport.close(1000, None).await.unwrap();

        let err = transport
            .send(Frame::Text("oops".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, PhoenixError::TransportClosed));
    }

    #[tokio::test]
    async fn double_close_is_idempotent() {
        let server = start_mock_server(|mut ws| async move {
            while let Some(Ok(_)) = ws.next().await {}
        })
        .await;

        let mut transport = WebSocketTransport::connect(&server, &[]).await.unwrap();
        transport.close(1000, None).await.unwrap();
        transport.close(1000, None).await.unwrap();
    }

    #[tokio::test]
    async fn send_round_trip() {
        let server = start_mock_server(|mut ws| async move {
            if let Some(Ok(Message::Text(text))) = ws.next().await {
                ws.send(Message::Text(text)).await.unwrap();
            }
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketTransport::connect(&server, &[]).await.unwrap();
        transport
            .send(Frame::Text("ping_echo".into()))
            .await
            .unwrap();

        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Text("ping_echo".into()));
    }

    #[tokio::test]
    async fn from_stream_constructor_works() {
        let server = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("from_stream_msg".into()))
                .await
                .unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let (ws_stream, _) = tokio_tungstenite::connect_async(server.as_str())
            .await
            .unwrap();
        let mut transport = WebSocketTransport::from_stream(ws_stream);

        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Text("from_stream_msg".into()));
    }

    #[tokio::test]
    async fn connector_hands_out_boxed_transports() {
        let server = start_mock_server(|mut ws| async move {
            ws.send(Message::Text("boxed".into())).await.unwrap();
            ws.close(None).await.unwrap();
        })
        .await;

        let mut transport = WebSocketConnector::new().connect(&server, &[]).await.unwrap();
        let frame = transport.recv().await.unwrap().unwrap();
        assert_eq!(frame, Frame::Text("boxed".into()));
    }
}
