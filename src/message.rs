//! Wire message record and payload representation.
//!
//! A [`Message`] is one frame of the channel protocol: the four header
//! strings (`join_ref`, `msg_ref`, `topic`, `event`) plus an opaque
//! [`Payload`] and, for replies, a `status`. Messages are immutable after
//! construction; the three constructors mirror the three wire shapes
//! (reply, addressed message, broadcast).

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::serializer::SerializerError;

// ── Reserved events ─────────────────────────────────────────────────

/// Event sent to join a channel topic.
pub const PHX_JOIN: &str = "phx_join";
/// Event sent to leave a channel topic.
pub const PHX_LEAVE: &str = "phx_leave";
/// Server reply to a client push.
pub const PHX_REPLY: &str = "phx_reply";
/// Server- or client-raised channel error.
pub const PHX_ERROR: &str = "phx_error";
/// Channel closed.
pub const PHX_CLOSE: &str = "phx_close";
/// Liveness probe event, sent on the reserved [`PHOENIX_TOPIC`].
pub const HEARTBEAT_EVENT: &str = "heartbeat";
/// Reserved topic for heartbeats.
pub const PHOENIX_TOPIC: &str = "phoenix";

/// Whether `event` is one of the reserved channel lifecycle events.
///
/// Lifecycle events from a previous join attempt must not leak into the
/// current one, so membership checks compare `join_ref` for these.
pub(crate) fn is_lifecycle_event(event: &str) -> bool {
    matches!(
        event,
        PHX_JOIN | PHX_LEAVE | PHX_REPLY | PHX_ERROR | PHX_CLOSE
    )
}

/// The synthetic event name a reply with reference `msg_ref` is re-dispatched
/// under, so per-push reply hooks can bind to it.
pub(crate) fn reply_event_name(msg_ref: &str) -> String {
    format!("chan_reply_{msg_ref}")
}

// ── Payload ─────────────────────────────────────────────────────────

/// Already-encoded user data carried by a [`Message`].
///
/// The serializer preserves the shape it decoded: a JSON value stays encoded
/// JSON bytes, a bare string reply response stays a raw string (so it is not
/// double-quoted on re-encode), and binary frame payloads stay opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Encoded JSON bytes of a payload value.
    Json(Vec<u8>),
    /// A bare string payload, stored as raw UTF-8 rather than quoted JSON.
    Text(String),
    /// Opaque bytes from a binary frame.
    Binary(Vec<u8>),
}

impl Payload {
    /// The empty JSON object payload, `{}`.
    pub fn empty() -> Self {
        Payload::Json(b"{}".to_vec())
    }

    /// Encode a serializable value as a JSON payload.
    ///
    /// # Panics
    ///
    /// Panics if the value cannot be encoded as JSON. Payloads are produced
    /// by the caller, so an unencodable value is a programming error.
    #[allow(clippy::panic)]
    pub fn json(value: &impl Serialize) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Payload::Json(bytes),
            Err(e) => panic!("failed to encode push payload as JSON: {e}"),
        }
    }

    /// The raw payload bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Json(bytes) | Payload::Binary(bytes) => bytes,
            Payload::Text(text) => text.as_bytes(),
        }
    }

    /// Decode a JSON payload into a typed value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::PayloadDecoding`] if the payload is binary
    /// or does not deserialize into `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, SerializerError> {
        let value = self.to_value()?;
        serde_json::from_value(value).map_err(|e| SerializerError::PayloadDecoding(e.to_string()))
    }

    /// View the payload as a dynamic JSON tree.
    ///
    /// A [`Payload::Text`] becomes a JSON string value.
    ///
    /// # Errors
    ///
    /// Returns [`SerializerError::PayloadDecoding`] for binary payloads or
    /// malformed JSON bytes.
    pub fn to_value(&self) -> Result<serde_json::Value, SerializerError> {
        match self {
            Payload::Json(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| SerializerError::PayloadDecoding(e.to_string())),
            Payload::Text(text) => Ok(serde_json::Value::String(text.clone())),
            Payload::Binary(_) => Err(SerializerError::PayloadDecoding(
                "binary payload is not JSON".into(),
            )),
        }
    }
}

// ── Message ─────────────────────────────────────────────────────────

/// One frame of the channel protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Reference of the join push that opened the channel this message
    /// belongs to, if any.
    pub join_ref: Option<String>,
    /// Reference correlating this message with its reply, if any.
    pub msg_ref: Option<String>,
    /// The topic, e.g. `"room:lobby"`.
    pub topic: String,
    /// The event name, e.g. `"phx_join"` or `"new_msg"`.
    pub event: String,
    /// Already-encoded user data.
    pub payload: Payload,
    /// Reply status (`"ok"`, `"error"`, `"timeout"`, …). Only populated for
    /// replies.
    pub status: Option<String>,
}

impl Message {
    /// A server reply. Fills `event = "phx_reply"` and carries `status`.
    pub fn reply(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        status: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: PHX_REPLY.to_string(),
            payload,
            status: Some(status.into()),
        }
    }

    /// An addressed message with an arbitrary event.
    pub fn message(
        join_ref: Option<String>,
        msg_ref: Option<String>,
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            join_ref,
            msg_ref,
            topic: topic.into(),
            event: event.into(),
            payload,
            status: None,
        }
    }

    /// A server broadcast: no references, sent to every subscriber of a topic.
    pub fn broadcast(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            join_ref: None,
            msg_ref: None,
            topic: topic.into(),
            event: event.into(),
            payload,
            status: None,
        }
    }
}
