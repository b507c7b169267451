//! Transport abstraction for the channel protocol.
//!
//! The [`Transport`] trait defines a bidirectional frame channel between the
//! client and server. The protocol uses text frames for the JSON array format
//! and binary frames for the length-prefixed binary format, so every
//! transport implementation must handle frame boundaries internally
//! (e.g. WebSocket frames).
//!
//! Because the socket reconnects with backoff, it does not hold a single
//! connected transport: it holds a [`Connector`], the factory it asks for a
//! fresh transport on every (re)connect attempt.
//!
//! # Implementing a Custom Transport
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use phoenix_channel_client::error::PhoenixError;
//! use phoenix_channel_client::transport::{Frame, Transport};
//!
//! struct MyTransport { /* ... */ }
//!
//! #[async_trait]
//! impl Transport for MyTransport {
//!     async fn send(&mut self, frame: Frame) -> Result<(), PhoenixError> {
//!         // Transmit one complete frame over your transport
//!         todo!()
//!     }
//!
//!     async fn recv(&mut self) -> Option<Result<Frame, PhoenixError>> {
//!         // Receive the next complete frame
//!         // Return None when the connection is closed
//!         todo!()
//!     }
//!
//!     async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), PhoenixError> {
//!         // Gracefully shut down the connection
//!         todo!()
//!     }
//! }
//! ```

use async_trait::async_trait;
use url::Url;

use crate::error::PhoenixError;

/// Close code for a normal closure, per the WebSocket spec.
pub const CLOSE_NORMAL: u16 = 1000;
/// Close code reported for an abnormal closure (never sent on the wire).
pub const CLOSE_ABNORMAL: u16 = 1006;

/// One complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A text frame carrying the JSON array format.
    Text(String),
    /// A binary frame carrying the length-prefixed binary format.
    Binary(Vec<u8>),
}

impl Frame {
    /// The raw bytes of the frame, for diagnostics.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Frame::Text(text) => text.as_bytes(),
            Frame::Binary(data) => data,
        }
    }
}

/// A bidirectional frame transport.
///
/// # Object Safety
///
/// This trait is object-safe; the socket drives connections through
/// `Box<dyn Transport>` so that a [`Connector`] can hand out any
/// implementation.
///
/// # Cancel Safety
///
/// [`recv`](Transport::recv) **MUST** be cancel-safe because the socket polls
/// it inside `tokio::select!`. If `recv` is cancelled before completion,
/// calling it again must not lose frames. Channel-based implementations are
/// naturally cancel-safe.
#[async_trait]
pub trait Transport: Send + 'static {
    /// Send one complete frame to the server.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::TransportSend`] if the frame could not be sent.
    async fn send(&mut self, frame: Frame) -> Result<(), PhoenixError>;

    /// Receive the next frame from the server.
    ///
    /// Returns:
    /// - `Some(Ok(frame))` — a complete frame was received
    /// - `Some(Err(e))` — a transport error occurred; the connection may
    ///   still deliver further frames
    /// - `None` — the connection is closed
    ///
    /// # Cancel Safety
    ///
    /// This method **MUST** be cancel-safe (see [trait documentation](Transport)).
    async fn recv(&mut self) -> Option<Result<Frame, PhoenixError>>;

    /// Close the transport with a WebSocket close code and optional reason.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake fails. Implementations should
    /// still release resources even when it does.
    async fn close(&mut self, code: u16, reason: Option<String>) -> Result<(), PhoenixError>;

    /// The close code observed from the peer's close frame, if any.
    ///
    /// Consulted after [`recv`](Transport::recv) returns `None` to decide
    /// whether the closure warrants a reconnect.
    fn close_code(&self) -> Option<u16> {
        None
    }
}

/// Factory for [`Transport`]s, invoked on every (re)connect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new transport to `url`, sending `headers` with the
    /// connection request.
    ///
    /// # Errors
    ///
    /// Returns [`PhoenixError::Connect`] (or an I/O error) when the
    /// connection cannot be established; the socket schedules a reconnect.
    async fn connect(
        &self,
        url: &Url,
        headers: &[(String, String)],
    ) -> Result<Box<dyn Transport>, PhoenixError>;
}
