//! Bi-directional codec for the channel protocol's wire formats.
//!
//! Every frame is either a text frame carrying a 5-element JSON array
//! `[join_ref, ref, topic, event, payload]`, or a binary frame with a 1-byte
//! kind tag followed by length-prefixed meta fields and the raw payload.
//! This module produces wire bytes identical to the server's serializer for
//! protocol version [`VSN`].
//!
//! Decoding failures never tear down the connection; the socket reports them
//! to its error callbacks and discards the frame.

use serde_json::Value;

use crate::message::{Message, Payload, PHX_REPLY};
use crate::transport::Frame;

/// Protocol version negotiated via the `vsn` query parameter.
pub const VSN: &str = "2.0.0";

// Binary frame kind tags.
const KIND_PUSH: u8 = 0;
const KIND_REPLY: u8 = 1;
const KIND_BROADCAST: u8 = 2;

/// Errors raised at the serializer boundary.
#[derive(Debug, thiserror::Error)]
pub enum SerializerError {
    /// A text frame (or binary meta field) was not valid UTF-8.
    #[error("frame is not valid UTF-8")]
    NotUtf8(#[from] std::str::Utf8Error),

    /// A text frame was not valid JSON.
    #[error("frame is not valid JSON: {0}")]
    InvalidJson(String),

    /// The outer JSON value was not a 5-element array.
    #[error("expected a 5-element [join_ref, ref, topic, event, payload] array")]
    InvalidMessageShape,

    /// The topic header was missing or not a string.
    #[error("message has no topic")]
    MissingTopic,

    /// The event header was missing or not a string.
    #[error("message has no event")]
    MissingEvent,

    /// A `phx_reply` payload was not an object with `response` and `status`.
    #[error("reply payload must be an object with `response` and `status`")]
    InvalidReplyStructure,

    /// A binary frame carried an unknown kind tag.
    #[error("unknown binary frame kind: {0}")]
    InvalidBinaryKind(u8),

    /// A binary frame ended before its declared field lengths.
    #[error("binary frame truncated")]
    TruncatedBinaryFrame,

    /// A meta field does not fit a single-byte length prefix.
    #[error("{field} exceeds 255 bytes ({len}) in a binary frame")]
    MetaTooLong {
        /// Which meta field overflowed.
        field: &'static str,
        /// Its actual UTF-8 length.
        len: usize,
    },

    /// A payload could not be decoded or re-encoded as JSON.
    #[error("failed to decode payload: {0}")]
    PayloadDecoding(String),
}

/// Codec for text and binary channel frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct Serializer;

impl Serializer {
    /// Decode an inbound frame into a [`Message`].
    ///
    /// # Errors
    ///
    /// Returns a [`SerializerError`] describing the first structural problem
    /// found; the caller discards the frame.
    pub fn decode(&self, frame: &Frame) -> Result<Message, SerializerError> {
        match frame {
            Frame::Text(text) => decode_text(text),
            Frame::Binary(data) => decode_binary(data),
        }
    }

    /// Encode an outbound [`Message`] into a frame.
    ///
    /// Messages with a [`Payload::Binary`] payload use binary framing (always
    /// kind `push` on the client side); everything else uses the text array.
    ///
    /// # Errors
    ///
    /// Returns an error if a JSON payload does not hold valid JSON bytes, or
    /// if a binary meta field exceeds the 255-byte length-prefix cap.
    pub fn encode(&self, message: &Message) -> Result<Frame, SerializerError> {
        match message.payload {
            Payload::Binary(_) => encode_binary(message).map(Frame::Binary),
            Payload::Json(_) | Payload::Text(_) => encode_text(message).map(Frame::Text),
        }
    }
}

// ── Text format ─────────────────────────────────────────────────────

fn decode_text(text: &str) -> Result<Message, SerializerError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SerializerError::InvalidJson(e.to_string()))?;
    let Value::Array(parts) = value else {
        return Err(SerializerError::InvalidMessageShape);
    };
    let [join_ref, msg_ref, topic, event, payload]: [Value; 5] = parts
        .try_into()
        .map_err(|_| SerializerError::InvalidMessageShape)?;

    let join_ref = header_ref(join_ref)?;
    let msg_ref = header_ref(msg_ref)?;
    let topic = match topic {
        Value::String(topic) => topic,
        _ => return Err(SerializerError::MissingTopic),
    };
    let event = match event {
        Value::String(event) => event,
        _ => return Err(SerializerError::MissingEvent),
    };

    if event == PHX_REPLY {
        let Value::Object(mut envelope) = payload else {
            return Err(SerializerError::InvalidReplyStructure);
        };
        let response = envelope
            .remove("response")
            .ok_or(SerializerError::InvalidReplyStructure)?;
        let status = match envelope.remove("status") {
            Some(Value::String(status)) => status,
            _ => return Err(SerializerError::InvalidReplyStructure),
        };
        // Bare string responses are stored as raw UTF-8 so re-encoding does
        // not double-quote them.
        let payload = match response {
            Value::String(text) => Payload::Text(text),
            other => Payload::Json(encode_value(&other)?),
        };
        Ok(Message::reply(join_ref, msg_ref, topic, status, payload))
    } else if join_ref.is_some() || msg_ref.is_some() {
        let payload = Payload::Json(encode_value(&payload)?);
        Ok(Message::message(join_ref, msg_ref, topic, event, payload))
    } else {
        let payload = Payload::Json(encode_value(&payload)?);
        Ok(Message::broadcast(topic, event, payload))
    }
}

fn encode_text(message: &Message) -> Result<String, SerializerError> {
    let payload = match (&message.event, &message.status) {
        (event, Some(status)) if event == PHX_REPLY => {
            // Rebuild the reply envelope so text round-trips are lossless.
            let mut envelope = serde_json::Map::with_capacity(2);
            envelope.insert("response".into(), payload_value(&message.payload)?);
            envelope.insert("status".into(), Value::String(status.clone()));
            Value::Object(envelope)
        }
        _ => payload_value(&message.payload)?,
    };

    let array = Value::Array(vec![
        header_value(&message.join_ref),
        header_value(&message.msg_ref),
        Value::String(message.topic.clone()),
        Value::String(message.event.clone()),
        payload,
    ]);
    serde_json::to_string(&array).map_err(|e| SerializerError::InvalidJson(e.to_string()))
}

/// A nullable header string from the outer array.
fn header_ref(value: Value) -> Result<Option<String>, SerializerError> {
    match value {
        Value::Null => Ok(None),
        Value::String(text) => Ok(Some(text)),
        _ => Err(SerializerError::InvalidMessageShape),
    }
}

fn header_value(header: &Option<String>) -> Value {
    match header {
        Some(text) => Value::String(text.clone()),
        None => Value::Null,
    }
}

fn payload_value(payload: &Payload) -> Result<Value, SerializerError> {
    match payload {
        Payload::Json(bytes) => serde_json::from_slice(bytes)
            .map_err(|e| SerializerError::PayloadDecoding(e.to_string())),
        Payload::Text(text) => Ok(Value::String(text.clone())),
        Payload::Binary(_) => Err(SerializerError::PayloadDecoding(
            "binary payload requires binary framing".into(),
        )),
    }
}

fn encode_value(value: &Value) -> Result<Vec<u8>, SerializerError> {
    serde_json::to_vec(value).map_err(|e| SerializerError::PayloadDecoding(e.to_string()))
}

// ── Binary format ───────────────────────────────────────────────────

fn encode_binary(message: &Message) -> Result<Vec<u8>, SerializerError> {
    let join_ref = message.join_ref.as_deref().unwrap_or("");
    let join_ref_len = meta_len("join_ref", join_ref)?;
    let topic_len = meta_len("topic", &message.topic)?;
    let event_len = meta_len("event", &message.event)?;
    let payload = message.payload.as_bytes();

    let mut buf = Vec::with_capacity(
        4 + join_ref.len() + message.topic.len() + message.event.len() + payload.len(),
    );
    buf.push(KIND_PUSH);
    buf.push(join_ref_len);
    buf.push(topic_len);
    buf.push(event_len);
    buf.extend_from_slice(join_ref.as_bytes());
    buf.extend_from_slice(message.topic.as_bytes());
    buf.extend_from_slice(message.event.as_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

fn decode_binary(data: &[u8]) -> Result<Message, SerializerError> {
    let (&kind, rest) = data
        .split_first()
        .ok_or(SerializerError::TruncatedBinaryFrame)?;
    match kind {
        KIND_PUSH => {
            let ([join_ref_len, topic_len, event_len], rest) = take_lens::<3>(rest)?;
            let (join_ref, rest) = take_str(rest, join_ref_len)?;
            let (topic, rest) = take_str(rest, topic_len)?;
            let (event, rest) = take_str(rest, event_len)?;
            if topic.is_empty() {
                return Err(SerializerError::MissingTopic);
            }
            if event.is_empty() {
                return Err(SerializerError::MissingEvent);
            }
            let join_ref = (!join_ref.is_empty()).then(|| join_ref.to_string());
            Ok(Message::message(
                join_ref,
                None,
                topic,
                event,
                Payload::Binary(rest.to_vec()),
            ))
        }
        KIND_REPLY => {
            let ([join_ref_len, msg_ref_len, topic_len, status_len], rest) = take_lens::<4>(rest)?;
            let (join_ref, rest) = take_str(rest, join_ref_len)?;
            let (msg_ref, rest) = take_str(rest, msg_ref_len)?;
            let (topic, rest) = take_str(rest, topic_len)?;
            // The binary reply envelope carries the reply status where text
            // frames would carry an event name.
            let (status, rest) = take_str(rest, status_len)?;
            if topic.is_empty() {
                return Err(SerializerError::MissingTopic);
            }
            let join_ref = (!join_ref.is_empty()).then(|| join_ref.to_string());
            let msg_ref = (!msg_ref.is_empty()).then(|| msg_ref.to_string());
            Ok(Message::reply(
                join_ref,
                msg_ref,
                topic,
                status,
                Payload::Binary(rest.to_vec()),
            ))
        }
        KIND_BROADCAST => {
            let ([topic_len, event_len], rest) = take_lens::<2>(rest)?;
            let (topic, rest) = take_str(rest, topic_len)?;
            let (event, rest) = take_str(rest, event_len)?;
            if topic.is_empty() {
                return Err(SerializerError::MissingTopic);
            }
            if event.is_empty() {
                return Err(SerializerError::MissingEvent);
            }
            Ok(Message::broadcast(
                topic,
                event,
                Payload::Binary(rest.to_vec()),
            ))
        }
        other => Err(SerializerError::InvalidBinaryKind(other)),
    }
}

fn meta_len(field: &'static str, value: &str) -> Result<u8, SerializerError> {
    u8::try_from(value.len()).map_err(|_| SerializerError::MetaTooLong {
        field,
        len: value.len(),
    })
}

/// Read `N` single-byte length prefixes.
fn take_lens<const N: usize>(data: &[u8]) -> Result<([u8; N], &[u8]), SerializerError> {
    if data.len() < N {
        return Err(SerializerError::TruncatedBinaryFrame);
    }
    let (lens, rest) = data.split_at(N);
    let lens: [u8; N] = lens
        .try_into()
        .map_err(|_| SerializerError::TruncatedBinaryFrame)?;
    Ok((lens, rest))
}

/// Read a length-prefixed UTF-8 meta field.
fn take_str(data: &[u8], len: u8) -> Result<(&str, &[u8]), SerializerError> {
    let len = usize::from(len);
    if data.len() < len {
        return Err(SerializerError::TruncatedBinaryFrame);
    }
    let (bytes, rest) = data.split_at(len);
    Ok((std::str::from_utf8(bytes)?, rest))
}
