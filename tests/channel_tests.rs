#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::indexing_slicing
)]
//! Channel-level integration tests: join protocol, push buffering, reply
//! hooks, stale-join filtering, rejoin, and leave, driven through the
//! scripted transport in `tests/common`.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{decode_sent, mock_connector, MockServer, ServerSession};
use phoenix_channel_client::{
    Channel, Frame, Payload, Serializer, Socket, SocketOptions,
};
use serde_json::json;

// ════════════════════════════════════════════════════════════════════
// Helpers
// ════════════════════════════════════════════════════════════════════

const TOPIC: &str = "room:lobby";

fn quiet_options() -> SocketOptions {
    // Heartbeats off so tests see exactly the frames they cause; rejoins
    // fast so error-path tests finish quickly.
    SocketOptions::new()
        .without_heartbeat()
        .with_rejoin_after(|_| Duration::from_millis(10))
}

async fn connected_socket() -> (Socket, MockServer, ServerSession) {
    let (connector, mut server) = mock_connector();
    let socket = Socket::new("ws://example.com/socket", connector, quiet_options());
    socket.connect().await.unwrap();
    let session = server.next_session().await;
    (socket, server, session)
}

/// Expect a `phx_join` for `TOPIC` and acknowledge it. Returns the join ref.
async fn accept_join(session: &mut ServerSession) -> String {
    let (join_ref, msg_ref, topic, event, _payload) = decode_sent(&session.next_sent().await);
    assert_eq!(topic, TOPIC);
    assert_eq!(event, "phx_join");
    assert_eq!(join_ref, msg_ref, "join pushes carry their own ref as join_ref");
    let join_ref = join_ref.unwrap();
    session.reply(Some(&join_ref), &join_ref, TOPIC, "ok", json!({}));
    join_ref
}

async fn joined_channel() -> (Socket, Channel, MockServer, ServerSession, String) {
    let (socket, server, mut session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));
    channel.join(None);
    let join_ref = accept_join(&mut session).await;
    common::eventually("channel joined", || channel.is_joined()).await;
    (socket, channel, server, session, join_ref)
}

// ════════════════════════════════════════════════════════════════════
// Join protocol
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_ok_transitions_to_joined() {
    let (_socket, channel, _server, _session, join_ref) = joined_channel().await;
    assert!(channel.is_joined());
    assert_eq!(channel.join_ref(), Some(join_ref));
}

#[tokio::test]
async fn join_hooks_fire_even_when_registered_after_the_reply() {
    let (socket, _server, mut session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));
    let join_push = channel.join(None);
    accept_join(&mut session).await;
    common::eventually("channel joined", || channel.is_joined()).await;

    // The reply is cached; a late hook runs immediately.
    let acked = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&acked);
    let _push = join_push.receive("ok", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    assert_eq!(acked.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn join_carries_the_channel_params_as_payload() {
    let (socket, _server, mut session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({"user": "alice"}));
    channel.join(None);

    let (_, _, _, event, payload) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_join");
    assert_eq!(payload, json!({"user": "alice"}));
}

#[tokio::test]
#[should_panic(expected = "multiple times")]
async fn join_twice_is_fatal() {
    let (socket, _server, _session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));
    channel.join(None);
    channel.join(None);
}

#[tokio::test]
#[should_panic(expected = "before joining")]
async fn push_before_join_is_fatal() {
    let (socket, _server, _session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));
    channel.push("ping", json!({}), None);
}

// ════════════════════════════════════════════════════════════════════
// Buffering across connects
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_and_pushes_queue_until_open_then_flush_in_order() {
    let (connector, mut server) = mock_connector();
    let socket = Socket::new("ws://example.com/socket", connector, quiet_options());
    let channel = socket.channel(TOPIC, json!({}));

    // No transport yet: everything queues, nothing is written.
    channel.join(None);
    channel.push("a", json!({"n": 1}), None);
    channel.push("b", json!({"n": 2}), None);

    socket.connect().await.unwrap();
    let mut session = server.next_session().await;

    // The buffered join flushes first.
    let join_ref = accept_join(&mut session).await;

    // The join ack flushes the channel's push buffer in FIFO order.
    let (a_join_ref, a_ref, _, a_event, a_payload) = decode_sent(&session.next_sent().await);
    let (b_join_ref, b_ref, _, b_event, b_payload) = decode_sent(&session.next_sent().await);
    assert_eq!((a_event.as_str(), b_event.as_str()), ("a", "b"));
    assert_eq!(a_payload, json!({"n": 1}));
    assert_eq!(b_payload, json!({"n": 2}));
    assert_eq!(a_join_ref, Some(join_ref.clone()));
    assert_eq!(b_join_ref, Some(join_ref));

    // Wire refs stay strictly increasing across the socket.
    let a_ref: u64 = a_ref.unwrap().parse().unwrap();
    let b_ref: u64 = b_ref.unwrap().parse().unwrap();
    assert!(a_ref < b_ref);

    common::eventually("channel joined", || channel.is_joined()).await;
    session
        .assert_nothing_sent(Duration::from_millis(50))
        .await;
}

// ════════════════════════════════════════════════════════════════════
// Join failure paths
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn join_error_reply_errors_the_channel_and_rejoins() {
    let (socket, _server, mut session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));

    let refused = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&refused);
    let _join_push = channel.join(None).receive("error", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let (join_ref, msg_ref, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_join");
    session.reply(
        join_ref.as_deref(),
        &msg_ref.unwrap(),
        TOPIC,
        "error",
        json!({"reason": "unauthorized"}),
    );

    common::eventually("channel errored", || channel.is_errored()).await;
    assert_eq!(refused.load(Ordering::SeqCst), 1);

    // The rejoin timer re-sends the join with a fresh ref.
    let second_ref = accept_join(&mut session).await;
    assert_ne!(Some(second_ref), join_ref);
    common::eventually("channel joined after rejoin", || channel.is_joined()).await;
}

#[tokio::test]
async fn join_timeout_sends_best_effort_leave_then_rejoins() {
    let (socket, _server, mut session) = connected_socket().await;
    let channel = socket.channel(TOPIC, json!({}));

    let timed_out = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&timed_out);
    let _join_push = channel
        .join(Some(Duration::from_millis(20)))
        .receive("timeout", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    let (_, _, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_join");
    // Never reply; the push timer fires locally.

    common::eventually("timeout hook fired", || {
        timed_out.load(Ordering::SeqCst) == 1
    })
    .await;
    common::eventually("channel errored", || channel.is_errored()).await;

    // A fire-and-forget leave for the stale attempt, then the rejoin.
    let (_, _, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_leave");
    let (_, _, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_join");
}

// ════════════════════════════════════════════════════════════════════
// Dispatch and membership
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stale_join_ref_lifecycle_messages_are_dropped() {
    let (_socket, channel, _server, session, join_ref) = joined_channel().await;

    // A phx_close from a previous join attempt must not close the channel.
    session.send_text(format!(r#"["999",null,"{TOPIC}","phx_close",{{}}]"#));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(channel.is_joined());

    // Non-lifecycle events are delivered regardless of join_ref.
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    channel.on("new_msg", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    session.send_text(format!(r#"["999",null,"{TOPIC}","new_msg",{{}}]"#));
    common::eventually("stale-tagged custom event delivered", || {
        seen.load(Ordering::SeqCst) == 1
    })
    .await;

    // The current join_ref does close it.
    session.send_text(format!(r#"["{join_ref}",null,"{TOPIC}","phx_close",{{}}]"#));
    common::eventually("channel closed", || channel.is_closed()).await;
}

#[tokio::test]
async fn bindings_fire_in_registration_order_and_off_removes_them() {
    let (_socket, channel, _server, session, _join_ref) = joined_channel().await;

    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    let record = Arc::clone(&order);
    let first = channel.on("new_msg", move |_| {
        record.lock().unwrap().push("first");
    });
    let record = Arc::clone(&order);
    channel.on("new_msg", move |_| {
        record.lock().unwrap().push("second");
    });

    session.broadcast(TOPIC, "new_msg", json!({}));
    common::eventually("both bindings fired", || order.lock().unwrap().len() == 2).await;
    assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);

    // Remove only the first binding, then broadcast again.
    channel.off("new_msg", Some(first));
    session.broadcast(TOPIC, "new_msg", json!({}));
    common::eventually("remaining binding fired", || {
        order.lock().unwrap().len() == 3
    })
    .await;
    assert_eq!(
        *order.lock().unwrap(),
        vec!["first", "second", "second"]
    );
}

#[tokio::test]
async fn on_message_transform_applies_before_bindings() {
    let (_socket, channel, _server, session, _join_ref) = joined_channel().await;

    channel.on_message(|mut message| {
        if message.event == "new_msg" {
            message.payload = Payload::json(&json!({"transformed": true}));
        }
        message
    });

    let seen: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&seen);
    channel.on("new_msg", move |message| {
        *record.lock().unwrap() = message.payload.to_value().ok();
    });

    session.broadcast(TOPIC, "new_msg", json!({"body": "original"}));
    common::eventually("transformed payload delivered", || {
        seen.lock().unwrap().is_some()
    })
    .await;
    assert_eq!(
        seen.lock().unwrap().clone().unwrap(),
        json!({"transformed": true})
    );
}

// ════════════════════════════════════════════════════════════════════
// Pushes and replies
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn push_reply_fires_the_matching_status_hook() {
    let (_socket, channel, _server, mut session, join_ref) = joined_channel().await;

    let reply_payload: Arc<Mutex<Option<serde_json::Value>>> = Arc::new(Mutex::new(None));
    let record = Arc::clone(&reply_payload);
    let errored = Arc::new(AtomicUsize::new(0));
    let error_counter = Arc::clone(&errored);
    let _push = channel
        .push("ping", json!({}), None)
        .receive("ok", move |message| {
            *record.lock().unwrap() = message.payload.to_value().ok();
        })
        .receive("error", move |_| {
            error_counter.fetch_add(1, Ordering::SeqCst);
        });

    let (push_join_ref, msg_ref, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "ping");
    assert_eq!(push_join_ref, Some(join_ref.clone()));

    session.reply(
        Some(&join_ref),
        &msg_ref.unwrap(),
        TOPIC,
        "ok",
        json!({"pong": true}),
    );

    common::eventually("ok hook fired", || reply_payload.lock().unwrap().is_some()).await;
    assert_eq!(
        reply_payload.lock().unwrap().clone().unwrap(),
        json!({"pong": true})
    );
    assert_eq!(errored.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn push_timeout_synthesizes_a_local_reply_once() {
    let (_socket, channel, _server, mut session, join_ref) = joined_channel().await;

    let timed_out = Arc::new(AtomicUsize::new(0));
    let acked = Arc::new(AtomicUsize::new(0));
    let timeout_counter = Arc::clone(&timed_out);
    let ok_counter = Arc::clone(&acked);
    let push = channel
        .push("ping", json!({}), Some(Duration::from_millis(20)))
        .receive("ok", move |_| {
            ok_counter.fetch_add(1, Ordering::SeqCst);
        })
        .receive("timeout", move |_| {
            timeout_counter.fetch_add(1, Ordering::SeqCst);
        });

    let (_, msg_ref, _, _, _) = decode_sent(&session.next_sent().await);

    common::eventually("timeout hook fired", || {
        timed_out.load(Ordering::SeqCst) == 1
    })
    .await;
    assert!(push.has_received("timeout"));

    // A late server reply must not double-deliver.
    session.reply(Some(&join_ref), &msg_ref.unwrap(), TOPIC, "ok", json!({}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(acked.load(Ordering::SeqCst), 0);
    assert_eq!(timed_out.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn binary_push_uses_binary_framing() {
    let (_socket, channel, _server, mut session, join_ref) = joined_channel().await;

    let _push = channel.binary_push("file_chunk", vec![1, 2, 3], None);

    let frame = session.next_sent().await;
    assert!(matches!(frame, Frame::Binary(_)));
    let decoded = Serializer.decode(&frame).unwrap();
    assert_eq!(decoded.join_ref, Some(join_ref));
    assert_eq!(decoded.topic, TOPIC);
    assert_eq!(decoded.event, "file_chunk");
    assert_eq!(decoded.payload, Payload::Binary(vec![1, 2, 3]));
}

// ════════════════════════════════════════════════════════════════════
// Leave
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn leave_sends_phx_leave_and_closes_locally() {
    let (_socket, channel, _server, mut session, join_ref) = joined_channel().await;

    let closed = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closed);
    channel.on_close(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    // The close path runs synchronously; the server ack is best-effort.
    channel.leave(None);
    assert!(channel.is_closed());
    assert_eq!(closed.load(Ordering::SeqCst), 1);

    let (_, msg_ref, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_leave");

    // A late server ack must not run the close path a second time.
    session.reply(Some(&join_ref), &msg_ref.unwrap(), TOPIC, "ok", json!({}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn leave_without_a_connection_closes_locally() {
    let (connector, _server) = mock_connector();
    let socket = Socket::new("ws://example.com/socket", connector, quiet_options());
    let channel = socket.channel(TOPIC, json!({}));
    channel.join(None);

    channel.leave(None);
    assert!(channel.is_closed());
}

// ════════════════════════════════════════════════════════════════════
// Reconnect / rejoin interplay
// ════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn transport_drop_errors_the_channel_and_open_rejoins_it() {
    let (_socket, channel, mut server, session, old_join_ref) = joined_channel().await;

    let errored = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&errored);
    channel.on_error(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    session.close(None);
    common::eventually("channel errored on transport drop", || {
        channel.is_errored()
    })
    .await;
    assert_eq!(errored.load(Ordering::SeqCst), 1);

    // The reconnect opens a new transport; the open event rejoins.
    let mut next_session = server.next_session().await;
    let new_join_ref = accept_join(&mut next_session).await;
    assert_ne!(new_join_ref, old_join_ref);
    common::eventually("channel joined after reconnect", || channel.is_joined()).await;
}

#[tokio::test]
async fn joining_a_duplicate_topic_leaves_the_open_channel() {
    let (socket, first, _server, mut session, _join_ref) = joined_channel().await;

    let second = socket.channel(TOPIC, json!({}));
    second.join(None);

    // The open channel is asked to leave (and closes locally) before the new
    // join goes out.
    assert!(first.is_closed());
    let (_, _, _, event, _) = decode_sent(&session.next_sent().await);
    assert_eq!(event, "phx_leave");
    let second_join_ref = accept_join(&mut session).await;

    common::eventually("second channel joined", || second.is_joined()).await;
    assert_eq!(second.join_ref(), Some(second_join_ref));
}
