//! # Phoenix Channel Client
//!
//! Transport-agnostic Rust client for the Phoenix Channels WebSocket
//! protocol.
//!
//! A [`Socket`] opens one logical connection to a server and multiplexes many
//! named [`Channel`]s (topics) over it. Each channel is an independently
//! joined conversation with lifecycle events, event subscriptions, and
//! per-push acknowledgement hooks (`ok`, `error`, `timeout`) on the returned
//! [`Push`].
//!
//! ## Features
//!
//! - **Transport-agnostic** — implement the [`Transport`] and [`Connector`]
//!   traits for any backend
//! - **Wire-compatible** — speaks protocol version 2.0.0, text and binary
//!   framing included
//! - **Self-healing** — heartbeat liveness detection, stepped-backoff
//!   reconnects, automatic channel rejoins, and send buffering across
//!   (re)connects
//! - **WebSocket built-in** — the default `transport-websocket` feature
//!   provides [`WebSocketTransport`](transports::WebSocketTransport) over
//!   `tokio-tungstenite`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # #[cfg(feature = "transport-websocket")]
//! # async fn example() -> Result<(), phoenix_channel_client::PhoenixError> {
//! use phoenix_channel_client::{Socket, SocketOptions};
//!
//! let socket = Socket::with_websocket("https://example.com/socket", SocketOptions::new());
//! socket.connect().await?;
//!
//! let channel = socket.channel("room:lobby", serde_json::json!({}));
//! channel
//!     .join(None)
//!     .receive("ok", |_| println!("joined"))
//!     .receive("error", |reply| println!("refused: {reply:?}"));
//!
//! channel.on("new_msg", |message| {
//!     println!("new_msg: {:?}", message.payload.to_value());
//! });
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod error;
pub mod message;
pub mod push;
pub mod serializer;
pub mod socket;
mod sync;
pub mod timer;
pub mod transport;
pub mod transports;

// Re-export primary types for ergonomic imports.
pub use channel::{Channel, ChannelState};
pub use error::PhoenixError;
pub use message::{Message, Payload};
pub use push::Push;
pub use serializer::{Serializer, SerializerError, VSN};
pub use socket::{ConnectParams, ConnectionState, Socket, SocketOptions};
pub use transport::{Connector, Frame, Transport};

#[cfg(feature = "transport-websocket")]
pub use transports::{WebSocketConnector, WebSocketTransport};
