#![allow(
    dead_code,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Shared test utilities for integration tests.
//!
//! Provides a channel-based scripted transport: each connect attempt on the
//! [`MockConnector`] hands the client a fresh [`MockTransport`] and emits the
//! matching [`ServerSession`] to the test, which can then inject inbound
//! frames, inspect everything the client sent, and close the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use url::Url;

use phoenix_channel_client::error::PhoenixError;
use phoenix_channel_client::transport::{Connector, Frame, Transport};

/// What the scripted server injects into the client transport.
pub enum ServerEvent {
    /// Deliver a frame.
    Frame(Frame),
    /// Surface a transport error (connection stays up).
    Error(String),
    /// Close the connection, optionally with a close code.
    Close(Option<u16>),
}

// ── MockTransport ───────────────────────────────────────────────────

pub struct MockTransport {
    incoming: mpsc::UnboundedReceiver<ServerEvent>,
    sent_tx: mpsc::UnboundedSender<Frame>,
    close_calls: Arc<Mutex<Vec<(u16, Option<String>)>>>,
    peer_close_code: Option<u16>,
    closed: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<(), PhoenixError> {
        if self.closed {
            return Err(PhoenixError::TransportClosed);
        }
        self.sent_tx
            .send(frame)
            .map_err(|_| PhoenixError::TransportSend("session dropped".into()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, PhoenixError>> {
        if self.closed {
            return None;
        }
        match self.incoming.recv().await {
            Some(ServerEvent::Frame(frame)) => Some(Ok(frame)),
            Some(ServerEvent::Error(error)) => Some(Err(PhoenixError::TransportReceive(error))),
            Some(ServerEvent::Close(code)) => {
                self.peer_close_code = code;
                self.closed = true;
                None
            }
            // Session handle dropped: the connection vanished without a code.
            None => None,
        }
    }

    async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), PhoenixError> {
        self.closed = true;
        self.close_calls.lock().unwrap().push((code, reason));
        Ok(())
    }

    fn close_code(&self) -> Option<u16> {
        self.peer_close_code
    }
}

// ── ServerSession ───────────────────────────────────────────────────

/// The server side of one mock connection.
pub struct ServerSession {
    /// The URL the client connected to.
    pub url: Url,
    /// Headers the client sent with the connection request.
    pub headers: Vec<(String, String)>,
    /// Inject inbound events.
    pub tx: mpsc::UnboundedSender<ServerEvent>,
    /// Frames the client sent, in order.
    pub sent_rx: mpsc::UnboundedReceiver<Frame>,
    /// Arguments of every `close` call on the client transport.
    pub close_calls: Arc<Mutex<Vec<(u16, Option<String>)>>>,
}

impl ServerSession {
    pub fn send_frame(&self, frame: Frame) {
        let _ = self.tx.send(ServerEvent::Frame(frame));
    }

    pub fn send_text(&self, text: impl Into<String>) {
        self.send_frame(Frame::Text(text.into()));
    }

    pub fn send_error(&self, error: impl Into<String>) {
        let _ = self.tx.send(ServerEvent::Error(error.into()));
    }

    /// Close the connection from the server side.
    pub fn close(&self, code: Option<u16>) {
        let _ = self.tx.send(ServerEvent::Close(code));
    }

    /// Send a `phx_reply` for the given ref.
    pub fn reply(
        &self,
        join_ref: Option<&str>,
        msg_ref: &str,
        topic: &str,
        status: &str,
        response: serde_json::Value,
    ) {
        let frame = serde_json::json!([
            join_ref,
            msg_ref,
            topic,
            "phx_reply",
            {"response": response, "status": status}
        ]);
        self.send_text(frame.to_string());
    }

    /// Send a broadcast (no refs).
    pub fn broadcast(&self, topic: &str, event: &str, payload: serde_json::Value) {
        let frame = serde_json::json!([null, null, topic, event, payload]);
        self.send_text(frame.to_string());
    }

    /// The next frame the client sent, or a panic after one second.
    pub async fn next_sent(&mut self) -> Frame {
        tokio::time::timeout(Duration::from_secs(1), self.sent_rx.recv())
            .await
            .expect("timed out waiting for a sent frame")
            .expect("transport dropped before sending")
    }

    /// Assert the client sends nothing for the given window.
    pub async fn assert_nothing_sent(&mut self, window: Duration) {
        if let Ok(frame) = tokio::time::timeout(window, self.sent_rx.recv()).await {
            panic!("expected no frame, but client sent {frame:?}");
        }
    }

    /// The recorded close calls on the client transport.
    pub fn close_calls(&self) -> Vec<(u16, Option<String>)> {
        self.close_calls.lock().unwrap().clone()
    }
}

/// Decode a sent text frame into its `[join_ref, ref, topic, event, payload]`
/// parts.
pub type SentParts = (
    Option<String>,
    Option<String>,
    String,
    String,
    serde_json::Value,
);

pub fn decode_sent(frame: &Frame) -> SentParts {
    match frame {
        Frame::Text(text) => serde_json::from_str(text).expect("sent frame is not a 5-array"),
        Frame::Binary(_) => panic!("expected a text frame, got binary"),
    }
}

// ── MockConnector ───────────────────────────────────────────────────

/// Hands out a fresh [`MockTransport`] per connect attempt.
pub struct MockConnector {
    sessions_tx: mpsc::UnboundedSender<ServerSession>,
    fail_next: Arc<AtomicBool>,
}

/// The test's view of the connector: connection attempts arrive here.
pub struct MockServer {
    sessions_rx: mpsc::UnboundedReceiver<ServerSession>,
    /// Set to make the next connect attempt fail.
    pub fail_next: Arc<AtomicBool>,
}

impl MockServer {
    /// The next accepted connection, or a panic after one second.
    pub async fn next_session(&mut self) -> ServerSession {
        tokio::time::timeout(Duration::from_secs(1), self.sessions_rx.recv())
            .await
            .expect("timed out waiting for a connection attempt")
            .expect("connector dropped")
    }

    /// Assert no connection attempt happens within the given window.
    pub async fn assert_no_session(&mut self, window: Duration) {
        if tokio::time::timeout(window, self.sessions_rx.recv())
            .await
            .is_ok()
        {
            panic!("expected no connection attempt, but one arrived");
        }
    }
}

pub fn mock_connector() -> (MockConnector, MockServer) {
    let (sessions_tx, sessions_rx) = mpsc::unbounded_channel();
    let fail_next = Arc::new(AtomicBool::new(false));
    (
        MockConnector {
            sessions_tx,
            fail_next: Arc::clone(&fail_next),
        },
        MockServer {
            sessions_rx,
            fail_next,
        },
    )
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Transport>, PhoenixError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(PhoenixError::Connect("scripted connect failure".into()));
        }
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let close_calls = Arc::new(Mutex::new(Vec::new()));

        let session = ServerSession {
            url: url.clone(),
            headers: headers.to_vec(),
            tx: inbound_tx,
            sent_rx,
            close_calls: Arc::clone(&close_calls),
        };
        self.sessions_tx
            .send(session)
            .map_err(|_| PhoenixError::Connect("test server dropped".into()))?;

        Ok(Box::new(MockTransport {
            incoming: inbound_rx,
            sent_tx,
            close_calls,
            peer_close_code: None,
            closed: false,
        }))
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Poll `predicate` until it holds, or panic after one second.
pub async fn eventually(what: &str, mut predicate: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {what}");
}
