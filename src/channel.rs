//! Topic-scoped channel state machine.
//!
//! A [`Channel`] is one asynchronously joined conversation on a topic,
//! multiplexed with its siblings over a single socket. It owns an event
//! binding table, a buffer of pushes made before the join completed, and a
//! rejoin timer with channel backoff. The join push's reply hooks drive the
//! state transitions: an `"ok"` reply moves the channel to `joined` and
//! flushes the buffer, an `"error"` or `"timeout"` reply moves it to
//! `errored` and schedules a rejoin.
//!
//! Inbound frames from a previous join attempt are filtered out by comparing
//! their `join_ref` against the current one (see [`ChannelCore::is_member`]).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::PhoenixError;
use crate::message::{
    is_lifecycle_event, reply_event_name, Message, Payload, PHX_CLOSE, PHX_ERROR, PHX_JOIN,
    PHX_LEAVE, PHX_REPLY,
};
use crate::push::{Push, PushCore};
use crate::socket::SocketCore;
use crate::sync::{lock, SyncArray};
use crate::timer::TimeoutTimer;

/// Callback invoked with a dispatched message.
pub(crate) type MessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// User-overridable transform applied to every message before dispatch.
type OnMessageHook = Arc<dyn Fn(Message) -> Message + Send + Sync>;

/// The lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// Not joined. The initial state, and the terminal state of each join.
    Closed,
    /// The join was refused, timed out, or the transport dropped; a rejoin
    /// is (or will be) scheduled.
    Errored,
    /// The server acknowledged the join.
    Joined,
    /// A join push is in flight.
    Joining,
    /// A leave push is in flight.
    Leaving,
}

/// An event subscription. `binding_ref` is channel-local and distinct from
/// wire refs.
#[derive(Clone)]
pub(crate) struct Binding {
    event: String,
    binding_ref: u64,
    callback: MessageCallback,
}

pub(crate) struct ChannelCore {
    topic: String,
    socket: Weak<SocketCore>,
    state: Mutex<ChannelState>,
    bindings: SyncArray<Binding>,
    binding_ref: AtomicU64,
    timeout: Mutex<Duration>,
    joined_once: AtomicBool,
    join_push: Arc<PushCore>,
    push_buffer: Mutex<Vec<Arc<PushCore>>>,
    rejoin_timer: TimeoutTimer,
    on_message: Mutex<OnMessageHook>,
    /// Socket callback subscriptions, torn down when the channel is removed.
    socket_hook_refs: Mutex<Vec<String>>,
}

impl ChannelCore {
    pub(crate) fn new(
        socket: &Arc<SocketCore>,
        topic: String,
        params: serde_json::Value,
    ) -> Arc<Self> {
        let timeout = socket.default_timeout();

        let channel = Arc::new_cyclic(|weak: &Weak<ChannelCore>| {
            let rejoin_target = weak.clone();
            let rejoin_timer = TimeoutTimer::new(socket.rejoin_after(), move || {
                if let Some(channel) = rejoin_target.upgrade() {
                    if channel.socket_is_connected() {
                        channel.rejoin(None);
                    }
                }
            });

            let join_push =
                PushCore::new(weak.clone(), PHX_JOIN, Payload::json(&params), timeout);

            ChannelCore {
                topic,
                socket: Arc::downgrade(socket),
                state: Mutex::new(ChannelState::Closed),
                bindings: SyncArray::new(),
                binding_ref: AtomicU64::new(0),
                timeout: Mutex::new(timeout),
                joined_once: AtomicBool::new(false),
                join_push,
                push_buffer: Mutex::new(Vec::new()),
                rejoin_timer,
                on_message: Mutex::new(Arc::new(|message| message)),
                socket_hook_refs: Mutex::new(Vec::new()),
            }
        });

        channel.install_join_push_hooks();
        channel.install_self_hooks();
        channel.subscribe_socket_hooks(socket);
        channel
    }

    // ── Construction-time hooks ─────────────────────────────────────

    /// The join push's reply hooks drive the channel's state transitions.
    fn install_join_push_hooks(self: &Arc<Self>) {
        let on_ok = Arc::downgrade(self);
        self.join_push.receive(
            "ok",
            Arc::new(move |_message: &Message| {
                let Some(channel) = on_ok.upgrade() else {
                    return;
                };
                debug!(topic = %channel.topic, "channel joined");
                channel.set_state(ChannelState::Joined);
                channel.rejoin_timer.reset();
                let buffered = std::mem::take(&mut *lock(&channel.push_buffer));
                for push in &buffered {
                    push.send();
                }
            }),
        );

        let on_error = Arc::downgrade(self);
        self.join_push.receive(
            "error",
            Arc::new(move |_message: &Message| {
                let Some(channel) = on_error.upgrade() else {
                    return;
                };
                debug!(topic = %channel.topic, "join refused");
                channel.set_state(ChannelState::Errored);
                if channel.socket_is_connected() {
                    channel.rejoin_timer.schedule_timeout();
                }
            }),
        );

        let on_timeout = Arc::downgrade(self);
        self.join_push.receive(
            "timeout",
            Arc::new(move |_message: &Message| {
                let Some(channel) = on_timeout.upgrade() else {
                    return;
                };
                warn!(topic = %channel.topic, timeout = ?channel.timeout(), "join timed out");
                // Best-effort leave so the server abandons the stale attempt.
                let leave_push = PushCore::new(
                    Arc::downgrade(&channel),
                    PHX_LEAVE,
                    Payload::empty(),
                    channel.timeout(),
                );
                leave_push.send();
                channel.set_state(ChannelState::Errored);
                channel.join_push.reset();
                if channel.socket_is_connected() {
                    channel.rejoin_timer.schedule_timeout();
                }
            }),
        );
    }

    fn install_self_hooks(self: &Arc<Self>) {
        let on_close = Arc::downgrade(self);
        self.bind(
            PHX_CLOSE,
            Arc::new(move |_message: &Message| {
                let Some(channel) = on_close.upgrade() else {
                    return;
                };
                debug!(topic = %channel.topic, "channel closed");
                channel.rejoin_timer.reset();
                channel.set_state(ChannelState::Closed);
                if let Some(socket) = channel.socket() {
                    socket.remove_channel(&channel);
                }
            }),
        );

        let on_error = Arc::downgrade(self);
        self.bind(
            PHX_ERROR,
            Arc::new(move |_message: &Message| {
                let Some(channel) = on_error.upgrade() else {
                    return;
                };
                debug!(topic = %channel.topic, "channel errored");
                if channel.state() == ChannelState::Joining {
                    // The join may still be sitting in the socket's send
                    // buffer; retract it before the retry allocates a new ref.
                    if let (Some(join_ref), Some(socket)) =
                        (channel.join_ref(), channel.socket())
                    {
                        socket.remove_from_send_buffer(&join_ref);
                    }
                    channel.join_push.reset();
                }
                channel.set_state(ChannelState::Errored);
                if channel.socket_is_connected() {
                    channel.rejoin_timer.schedule_timeout();
                }
            }),
        );

        // Replies are re-dispatched under their synthetic `chan_reply_<ref>`
        // event so the originating push's binding sees them.
        let on_reply = Arc::downgrade(self);
        self.bind(
            PHX_REPLY,
            Arc::new(move |message: &Message| {
                let Some(channel) = on_reply.upgrade() else {
                    return;
                };
                let Some(msg_ref) = &message.msg_ref else {
                    return;
                };
                let mut renamed = message.clone();
                renamed.event = reply_event_name(msg_ref);
                channel.trigger(renamed);
            }),
        );
    }

    fn subscribe_socket_hooks(self: &Arc<Self>, socket: &Arc<SocketCore>) {
        let on_open = Arc::downgrade(self);
        let open_ref = socket.register_open_hook(Arc::new(move || {
            let Some(channel) = on_open.upgrade() else {
                return;
            };
            channel.rejoin_timer.reset();
            if channel.state() == ChannelState::Errored {
                channel.rejoin(None);
            }
        }));

        let on_error = Arc::downgrade(self);
        let error_ref = socket.register_error_hook(Arc::new(move |_error: &PhoenixError| {
            // The next transport open drives the rejoin.
            if let Some(channel) = on_error.upgrade() {
                channel.rejoin_timer.reset();
            }
        }));

        *lock(&self.socket_hook_refs) = vec![open_ref, error_ref];
    }

    // ── Join / leave ────────────────────────────────────────────────

    pub(crate) fn rejoin(self: &Arc<Self>, timeout: Option<Duration>) {
        if self.state() == ChannelState::Leaving {
            return;
        }
        if let Some(socket) = self.socket() {
            // At most one open channel per topic.
            socket.leave_open_topic(&self.topic, self);
        }
        self.set_state(ChannelState::Joining);
        self.join_push.resend(timeout.unwrap_or_else(|| self.timeout()));
    }

    pub(crate) fn leave(self: &Arc<Self>, timeout: Option<Duration>) -> Arc<PushCore> {
        self.rejoin_timer.reset();
        self.join_push.cancel_timeout();
        self.set_state(ChannelState::Leaving);

        let close_target = Arc::downgrade(self);
        let on_settled: MessageCallback = Arc::new(move |_message: &Message| {
            let Some(channel) = close_target.upgrade() else {
                return;
            };
            debug!(topic = %channel.topic, "leave");
            channel.trigger(Message::broadcast(
                channel.topic.clone(),
                PHX_CLOSE,
                Payload::json(&serde_json::json!({"reason": "leave"})),
            ));
        });

        let push = PushCore::new(
            Arc::downgrade(self),
            PHX_LEAVE,
            Payload::empty(),
            timeout.unwrap_or_else(|| self.timeout()),
        );
        push.receive("ok", Arc::clone(&on_settled));
        push.receive("timeout", on_settled);
        push.send();
        if !self.can_push() {
            // The state is already `leaving`, so this always holds: the close
            // path runs locally and the server ack is best-effort.
            push.trigger("ok", Payload::empty());
        }
        push
    }

    // ── Dispatch ────────────────────────────────────────────────────

    /// Whether an inbound message belongs to this channel.
    ///
    /// Lifecycle events tagged with a different `join_ref` belong to a stale
    /// join attempt and are dropped.
    pub(crate) fn is_member(&self, message: &Message) -> bool {
        if message.topic != self.topic {
            return false;
        }
        if message.join_ref.is_some()
            && message.join_ref != self.join_ref()
            && is_lifecycle_event(&message.event)
        {
            warn!(
                topic = %self.topic,
                event = %message.event,
                join_ref = ?message.join_ref,
                "dropping outdated message"
            );
            return false;
        }
        true
    }

    /// Run the `on_message` transform, then every binding matching the event,
    /// in registration order.
    pub(crate) fn trigger(&self, message: Message) {
        let transform = lock(&self.on_message).clone();
        let message = transform(message);
        let bindings = self.bindings.snapshot();
        for binding in bindings.iter().filter(|b| b.event == message.event) {
            (binding.callback)(&message);
        }
    }

    pub(crate) fn bind(&self, event: &str, callback: MessageCallback) -> u64 {
        let binding_ref = self.binding_ref.fetch_add(1, Ordering::SeqCst);
        self.bindings.push(Binding {
            event: event.to_string(),
            binding_ref,
            callback,
        });
        binding_ref
    }

    pub(crate) fn unbind(&self, event: &str, binding_ref: Option<u64>) {
        self.bindings.retain(|binding| {
            !(binding.event == event
                && binding_ref.map_or(true, |wanted| wanted == binding.binding_ref))
        });
    }

    // ── Accessors ───────────────────────────────────────────────────

    pub(crate) fn topic(&self) -> &str {
        &self.topic
    }

    /// The wire ref of the current join push, if one is outstanding.
    pub(crate) fn join_ref(&self) -> Option<String> {
        self.join_push.msg_ref()
    }

    pub(crate) fn state(&self) -> ChannelState {
        *lock(&self.state)
    }

    fn set_state(&self, state: ChannelState) {
        *lock(&self.state) = state;
    }

    pub(crate) fn socket(&self) -> Option<Arc<SocketCore>> {
        self.socket.upgrade()
    }

    fn socket_is_connected(&self) -> bool {
        self.socket().is_some_and(|socket| socket.is_connected())
    }

    /// Whether a push can go straight to the transport rather than the
    /// channel's buffer.
    fn can_push(&self) -> bool {
        self.socket_is_connected() && self.state() == ChannelState::Joined
    }

    fn timeout(&self) -> Duration {
        *lock(&self.timeout)
    }

    pub(crate) fn socket_hook_refs(&self) -> Vec<String> {
        lock(&self.socket_hook_refs).clone()
    }
}

impl std::fmt::Debug for ChannelCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("topic", &self.topic)
            .field("state", &self.state())
            .field("joined_once", &self.joined_once.load(Ordering::SeqCst))
            .finish()
    }
}

// ── Public handle ───────────────────────────────────────────────────

/// Handle to a topic-scoped channel.
///
/// Created via [`Socket::channel`](crate::Socket::channel). Cloning the
/// handle does not clone the channel; both handles address the same
/// conversation.
#[derive(Debug, Clone)]
pub struct Channel {
    pub(crate) core: Arc<ChannelCore>,
}

impl Channel {
    /// Join the channel's topic, returning the join [`Push`] so `ok`/`error`/
    /// `timeout` hooks can be attached.
    ///
    /// `timeout` overrides the channel's push timeout for this and later
    /// rejoins.
    ///
    /// # Panics
    ///
    /// Panics if called more than once on the same channel instance; rejoins
    /// after errors are automatic, driven by the rejoin timer.
    #[allow(clippy::panic)]
    pub fn join(&self, timeout: Option<Duration>) -> Push {
        if self.core.joined_once.swap(true, Ordering::SeqCst) {
            panic!(
                "tried to join {:?} multiple times; join() can only be called once per channel",
                self.core.topic
            );
        }
        if let Some(timeout) = timeout {
            *lock(&self.core.timeout) = timeout;
        }
        self.core.rejoin(None);
        Push {
            core: Arc::clone(&self.core.join_push),
        }
    }

    /// Subscribe `callback` to an event. Returns a binding ref usable with
    /// [`off`](Self::off). Bindings for the same event fire in registration
    /// order.
    pub fn on(&self, event: &str, callback: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        self.core.bind(event, Arc::new(callback))
    }

    /// Unsubscribe bindings for `event` — all of them, or only the one with
    /// the given binding ref.
    pub fn off(&self, event: &str, binding_ref: Option<u64>) {
        self.core.unbind(event, binding_ref);
    }

    /// Subscribe to the channel closing.
    pub fn on_close(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        self.on(PHX_CLOSE, callback)
    }

    /// Subscribe to channel errors.
    pub fn on_error(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> u64 {
        self.on(PHX_ERROR, callback)
    }

    /// Replace the transform applied to every inbound message before
    /// dispatch. The default is the identity.
    pub fn on_message(&self, transform: impl Fn(Message) -> Message + Send + Sync + 'static) {
        *lock(&self.core.on_message) = Arc::new(transform);
    }

    /// Push an event with a JSON payload.
    ///
    /// If the socket is connected and the channel joined, the push is sent
    /// immediately; otherwise it is buffered (with its timeout already
    /// running) and flushed in order once the join completes.
    ///
    /// # Panics
    ///
    /// Panics if called before [`join`](Self::join).
    pub fn push(
        &self,
        event: &str,
        payload: serde_json::Value,
        timeout: Option<Duration>,
    ) -> Push {
        self.push_payload(event, Payload::json(&payload), timeout)
    }

    /// Push an event with an opaque binary payload, sent as a binary frame.
    ///
    /// # Panics
    ///
    /// Panics if called before [`join`](Self::join).
    pub fn binary_push(&self, event: &str, data: Vec<u8>, timeout: Option<Duration>) -> Push {
        self.push_payload(event, Payload::Binary(data), timeout)
    }

    #[allow(clippy::panic)]
    fn push_payload(&self, event: &str, payload: Payload, timeout: Option<Duration>) -> Push {
        if !self.core.joined_once.load(Ordering::SeqCst) {
            panic!(
                "tried to push {event:?} to {:?} before joining; call join() first",
                self.core.topic
            );
        }
        let push = PushCore::new(
            Arc::downgrade(&self.core),
            event,
            payload,
            timeout.unwrap_or_else(|| self.core.timeout()),
        );
        if self.core.can_push() {
            push.send();
        } else {
            push.start_timeout();
            lock(&self.core.push_buffer).push(Arc::clone(&push));
        }
        Push { core: push }
    }

    /// Leave the topic.
    ///
    /// The `phx_leave` push goes to the server best-effort, but the close
    /// path runs locally and synchronously: the channel is `closed` (and
    /// removed from the socket) by the time this returns.
    pub fn leave(&self, timeout: Option<Duration>) -> Push {
        Push {
            core: self.core.leave(timeout),
        }
    }

    // ── State ───────────────────────────────────────────────────────

    /// The channel's topic.
    pub fn topic(&self) -> &str {
        self.core.topic()
    }

    /// The current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.core.state()
    }

    /// The wire ref of the current join push, if one is outstanding.
    pub fn join_ref(&self) -> Option<String> {
        self.core.join_ref()
    }

    /// Whether the channel is `closed`.
    pub fn is_closed(&self) -> bool {
        self.state() == ChannelState::Closed
    }

    /// Whether the channel is `errored`.
    pub fn is_errored(&self) -> bool {
        self.state() == ChannelState::Errored
    }

    /// Whether the channel is `joined`.
    pub fn is_joined(&self) -> bool {
        self.state() == ChannelState::Joined
    }

    /// Whether the channel is `joining`.
    pub fn is_joining(&self) -> bool {
        self.state() == ChannelState::Joining
    }

    /// Whether the channel is `leaving`.
    pub fn is_leaving(&self) -> bool {
        self.state() == ChannelState::Leaving
    }
}
