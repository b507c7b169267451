//! Error types for the Phoenix channel client.

use thiserror::Error;

use crate::serializer::SerializerError;

/// Errors that can occur when using the Phoenix channel client.
#[derive(Debug, Error)]
pub enum PhoenixError {
    /// Failed to send a frame through the transport.
    #[error("transport send error: {0}")]
    TransportSend(String),

    /// Failed to receive a frame from the transport.
    #[error("transport receive error: {0}")]
    TransportReceive(String),

    /// The transport connection was closed unexpectedly.
    #[error("transport connection closed")]
    TransportClosed,

    /// Failed to establish a transport connection.
    #[error("connection error: {0}")]
    Connect(String),

    /// An inbound frame could not be decoded.
    ///
    /// Carries the raw frame bytes for diagnostics; the frame itself is
    /// discarded and the connection stays open.
    #[error("failed to decode inbound frame: {error}")]
    Decode {
        /// The decoding failure.
        #[source]
        error: SerializerError,
        /// The raw bytes of the offending frame.
        bytes: Vec<u8>,
    },

    /// Attempted an operation that requires an active connection, but the
    /// socket is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// An operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A specialized [`Result`] type for Phoenix channel client operations.
pub type Result<T> = std::result::Result<T, PhoenixError>;
