//! A single outbound message with its timeout and reply hooks.
//!
//! A [`Push`] owns the encoded payload, a one-shot timeout task, and a table
//! of status-keyed receive hooks. Sending allocates a wire reference from the
//! socket and installs a one-shot channel binding on the synthetic
//! `chan_reply_<ref>` event; when the matching reply arrives (or the timeout
//! fires a local `"timeout"` reply), the hooks for that status run in
//! registration order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::debug;

use crate::channel::{ChannelCore, MessageCallback};
use crate::message::{reply_event_name, Message, Payload};
use crate::sync::{lock, SyncArray};

/// A status-keyed reply hook. Multiple hooks per status are allowed and fire
/// in registration order.
#[derive(Clone)]
struct ReceiveHook {
    status: String,
    callback: MessageCallback,
}

pub(crate) struct PushCore {
    channel: Weak<ChannelCore>,
    event: String,
    payload: Mutex<Payload>,
    timeout: Mutex<Duration>,
    received: Mutex<Option<Message>>,
    hooks: SyncArray<ReceiveHook>,
    sent: AtomicBool,
    msg_ref: Mutex<Option<String>>,
    ref_event: Mutex<Option<String>>,
    ref_binding: Mutex<Option<u64>>,
    timeout_task: Mutex<Option<AbortHandle>>,
}

impl PushCore {
    pub(crate) fn new(
        channel: Weak<ChannelCore>,
        event: impl Into<String>,
        payload: Payload,
        timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            event: event.into(),
            payload: Mutex::new(payload),
            timeout: Mutex::new(timeout),
            received: Mutex::new(None),
            hooks: SyncArray::new(),
            sent: AtomicBool::new(false),
            msg_ref: Mutex::new(None),
            ref_event: Mutex::new(None),
            ref_binding: Mutex::new(None),
            timeout_task: Mutex::new(None),
        })
    }

    /// Send the push over the socket.
    ///
    /// An already-sent push only re-arms its timeout; otherwise a wire ref is
    /// allocated, the reply binding installed, the timeout armed, and the
    /// message handed to the socket (or its send buffer, when disconnected).
    pub(crate) fn send(self: &Arc<Self>) {
        if self.sent.load(Ordering::SeqCst) {
            self.rearm_timeout();
            return;
        }
        self.start_timeout();
        self.sent.store(true, Ordering::SeqCst);

        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };
        let message = Message::message(
            channel.join_ref(),
            lock(&self.msg_ref).clone(),
            channel.topic().to_string(),
            self.event.clone(),
            lock(&self.payload).clone(),
        );
        socket.push_message(message);
    }

    /// Reset and re-send with a new timeout; used by rejoin attempts so the
    /// retry carries a fresh wire ref.
    pub(crate) fn resend(self: &Arc<Self>, timeout: Duration) {
        *lock(&self.timeout) = timeout;
        self.reset();
        self.send();
    }

    /// Arm the timeout without sending.
    ///
    /// Allocates the wire ref and installs the reply binding, so a push
    /// buffered while the channel has not joined yet can already receive a
    /// local `"timeout"` reply.
    pub(crate) fn start_timeout(self: &Arc<Self>) {
        self.cancel_timeout();
        self.cancel_ref_event();

        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(socket) = channel.socket() else {
            return;
        };

        let msg_ref = socket.make_ref();
        let ref_event = reply_event_name(&msg_ref);
        *lock(&self.msg_ref) = Some(msg_ref);
        *lock(&self.ref_event) = Some(ref_event.clone());

        let reply_target: Weak<PushCore> = Arc::downgrade(self);
        let binding_ref = channel.bind(
            &ref_event,
            Arc::new(move |message: &Message| {
                if let Some(push) = reply_target.upgrade() {
                    push.handle_reply(message);
                }
            }),
        );
        *lock(&self.ref_binding) = Some(binding_ref);

        self.arm_timeout_task();
    }

    /// Cancel and reschedule the timeout task only, keeping the in-flight
    /// wire ref and reply binding. Used when `send` is called on a push that
    /// already went out.
    fn rearm_timeout(self: &Arc<Self>) {
        self.cancel_timeout();
        self.arm_timeout_task();
    }

    fn arm_timeout_task(self: &Arc<Self>) {
        let timeout = *lock(&self.timeout);
        let expired: Weak<PushCore> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(push) = expired.upgrade() {
                debug!(event = %push.event, ?timeout, "push timed out");
                push.trigger("timeout", Payload::empty());
            }
        });
        *lock(&self.timeout_task) = Some(task.abort_handle());
    }

    /// Register a reply hook for `status`.
    ///
    /// If a matching reply was already received, the callback is invoked
    /// immediately with the cached message before being registered.
    pub(crate) fn receive(&self, status: &str, callback: MessageCallback) {
        let cached = lock(&self.received).clone();
        if let Some(message) = cached {
            if message.status.as_deref() == Some(status) {
                callback(&message);
            }
        }
        self.hooks.push(ReceiveHook {
            status: status.to_string(),
            callback,
        });
    }

    /// Whether a reply with the given status has been received.
    pub(crate) fn has_received(&self, status: &str) -> bool {
        lock(&self.received)
            .as_ref()
            .is_some_and(|message| message.status.as_deref() == Some(status))
    }

    /// Return the push to its pre-send state so the next [`send`](Self::send)
    /// allocates a new wire ref.
    pub(crate) fn reset(&self) {
        self.cancel_ref_event();
        self.cancel_timeout();
        *lock(&self.msg_ref) = None;
        *lock(&self.ref_event) = None;
        *lock(&self.received) = None;
        self.sent.store(false, Ordering::SeqCst);
    }

    /// Synthesize a local reply and deliver it through the same hook fan-out
    /// a server reply would take. No-op before the first send.
    pub(crate) fn trigger(&self, status: &str, payload: Payload) {
        let Some(ref_event) = lock(&self.ref_event).clone() else {
            return;
        };
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let mut message = Message::reply(
            channel.join_ref(),
            lock(&self.msg_ref).clone(),
            channel.topic().to_string(),
            status,
            payload,
        );
        message.event = ref_event;
        channel.trigger(message);
    }

    /// The wire ref of the in-flight send, if any.
    pub(crate) fn msg_ref(&self) -> Option<String> {
        lock(&self.msg_ref).clone()
    }

    pub(crate) fn cancel_timeout(&self) {
        if let Some(task) = lock(&self.timeout_task).take() {
            task.abort();
        }
    }

    /// The reply binding fired: cache the message, stop the timer, fan out to
    /// matching hooks, then drop the binding so a misbehaving server cannot
    /// deliver the reply twice.
    fn handle_reply(&self, message: &Message) {
        *lock(&self.received) = Some(message.clone());
        self.cancel_timeout();
        if let Some(status) = &message.status {
            let hooks = self.hooks.snapshot();
            for hook in hooks.iter().filter(|hook| &hook.status == status) {
                (hook.callback)(message);
            }
        }
        self.cancel_ref_event();
    }

    fn cancel_ref_event(&self) {
        let Some(binding_ref) = lock(&self.ref_binding).take() else {
            return;
        };
        let Some(ref_event) = lock(&self.ref_event).clone() else {
            return;
        };
        if let Some(channel) = self.channel.upgrade() {
            channel.unbind(&ref_event, Some(binding_ref));
        }
    }
}

impl std::fmt::Debug for PushCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Push")
            .field("event", &self.event)
            .field("sent", &self.sent.load(Ordering::SeqCst))
            .field("ref", &*lock(&self.msg_ref))
            .finish()
    }
}

/// Handle to a single outbound message and its pending reply hooks.
///
/// Returned by [`Channel::join`](crate::Channel::join),
/// [`Channel::push`](crate::Channel::push), and
/// [`Channel::leave`](crate::Channel::leave). Hooks chain:
///
/// ```rust,ignore
/// channel
///     .push("new_msg", serde_json::json!({"body": "hi"}), None)
///     .receive("ok", |reply| println!("acked: {reply:?}"))
///     .receive("error", |reply| println!("rejected: {reply:?}"))
///     .receive("timeout", |_| println!("no reply in time"));
/// ```
#[derive(Debug, Clone)]
pub struct Push {
    pub(crate) core: Arc<PushCore>,
}

impl Push {
    /// Register a hook for replies with the given status (`"ok"`, `"error"`,
    /// `"timeout"`, or any server-defined status).
    ///
    /// If a matching reply already arrived, `callback` runs immediately with
    /// the cached message.
    pub fn receive(
        self,
        status: &str,
        callback: impl Fn(&Message) + Send + Sync + 'static,
    ) -> Self {
        self.core.receive(status, Arc::new(callback));
        self
    }

    /// Whether a reply with the given status has been received.
    pub fn has_received(&self, status: &str) -> bool {
        self.core.has_received(status)
    }
}
