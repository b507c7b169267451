//! Socket engine: transport owner, channel multiplexer, heartbeat, and
//! reconnect policy.
//!
//! [`Socket`] is a thin handle over shared state. Each (re)connect asks the
//! injected [`Connector`] for a fresh transport and spawns a connection task
//! that multiplexes outgoing commands and inbound frames with
//! `tokio::select!`; every inbound frame is decoded and fanned out inline on
//! that task, so message delivery and state-change callbacks are serialized.
//! The heartbeat runs on its own timer task and posts back through the
//! command channel when it has to force a close.
//!
//! Reconnects and rejoins are independent: the socket's reconnect timer
//! re-establishes the transport with stepped backoff, and a transport open
//! event makes every `errored` channel rejoin.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use url::Url;

use crate::channel::{Channel, ChannelCore, ChannelState};
use crate::error::PhoenixError;
use crate::message::{Message, Payload, HEARTBEAT_EVENT, PHOENIX_TOPIC, PHX_ERROR};
use crate::serializer::{Serializer, VSN};
use crate::sync::{lock, SyncArray};
use crate::timer::{reconnect_after, rejoin_after, BackoffCalc, HeartbeatTimer, TimeoutTimer};
use crate::transport::{Connector, Frame, Transport, CLOSE_ABNORMAL, CLOSE_NORMAL};

/// Default reply timeout for pushes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between heartbeats.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

// ── Connection state ────────────────────────────────────────────────

/// Observable connection state of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// A connect attempt is in flight.
    Connecting,
    /// The transport is established.
    Open,
    /// A close was requested and is in flight.
    Closing,
    /// No transport. The initial state.
    Closed,
}

/// Why the transport closed, from the socket's point of view.
///
/// A wire close code only refines a still-`Unknown` status, so a status the
/// socket recorded itself (user disconnect, heartbeat timeout) always wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseStatus {
    /// No close recorded yet, or the peer vanished without a code.
    Unknown,
    /// A normal closure (code 1000).
    Clean,
    /// Any other explicit close code.
    Custom(u16),
    /// An abnormal closure; the socket will reconnect.
    Abnormal,
}

impl CloseStatus {
    fn from_code(code: Option<u16>) -> Self {
        match code {
            None => CloseStatus::Unknown,
            Some(CLOSE_NORMAL) => CloseStatus::Clean,
            Some(CLOSE_ABNORMAL) => CloseStatus::Abnormal,
            Some(code) => CloseStatus::Custom(code),
        }
    }

    fn update(&mut self, code: Option<u16>) {
        if *self == CloseStatus::Unknown {
            *self = Self::from_code(code);
        }
    }

    fn should_reconnect(self) -> bool {
        matches!(self, CloseStatus::Unknown | CloseStatus::Abnormal)
    }
}

// ── Options ─────────────────────────────────────────────────────────

/// Query parameters appended to the connect URL.
#[derive(Clone)]
pub enum ConnectParams {
    /// A fixed parameter list.
    Static(Vec<(String, String)>),
    /// Re-evaluated on every (re)connect, e.g. for rotating tokens.
    Dynamic(Arc<dyn Fn() -> Vec<(String, String)> + Send + Sync>),
}

impl ConnectParams {
    fn resolve(&self) -> Vec<(String, String)> {
        match self {
            ConnectParams::Static(params) => params.clone(),
            ConnectParams::Dynamic(params) => params(),
        }
    }
}

impl Default for ConnectParams {
    fn default() -> Self {
        ConnectParams::Static(Vec::new())
    }
}

impl std::fmt::Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectParams::Static(params) => f.debug_tuple("Static").field(params).finish(),
            ConnectParams::Dynamic(_) => f.write_str("Dynamic(..)"),
        }
    }
}

/// Configuration for a [`Socket`].
///
/// All fields have defaults; override them with the builder methods.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use phoenix_channel_client::SocketOptions;
///
/// let options = SocketOptions::new()
///     .with_params(vec![("token".into(), "abc123".into())])
///     .with_heartbeat_interval(Duration::from_secs(15));
/// ```
#[derive(Clone)]
pub struct SocketOptions {
    /// Default reply timeout for pushes. Defaults to 10 seconds.
    pub timeout: Duration,
    /// Interval between heartbeats. Defaults to 30 seconds.
    pub heartbeat_interval: Duration,
    /// Disable heartbeats entirely (e.g. when running custom liveness).
    pub skip_heartbeat: bool,
    /// Query parameters appended to the connect URL after `vsn`.
    pub params: ConnectParams,
    /// Headers sent with the transport's connection request.
    pub headers: Vec<(String, String)>,
    /// Backoff between reconnect attempts.
    pub reconnect_after: BackoffCalc,
    /// Backoff between channel rejoin attempts.
    pub rejoin_after: BackoffCalc,
}

impl SocketOptions {
    /// Options with the default timings and backoff tables.
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            skip_heartbeat: false,
            params: ConnectParams::default(),
            headers: Vec::new(),
            reconnect_after: Arc::new(reconnect_after),
            rejoin_after: Arc::new(rejoin_after),
        }
    }

    /// Set the default push timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the heartbeat interval.
    #[must_use]
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Disable heartbeats.
    #[must_use]
    pub fn without_heartbeat(mut self) -> Self {
        self.skip_heartbeat = true;
        self
    }

    /// Set static connect query parameters.
    #[must_use]
    pub fn with_params(mut self, params: Vec<(String, String)>) -> Self {
        self.params = ConnectParams::Static(params);
        self
    }

    /// Set connect query parameters re-evaluated on every (re)connect.
    #[must_use]
    pub fn with_dynamic_params(
        mut self,
        params: impl Fn() -> Vec<(String, String)> + Send + Sync + 'static,
    ) -> Self {
        self.params = ConnectParams::Dynamic(Arc::new(params));
        self
    }

    /// Set headers sent with the connection request.
    #[must_use]
    pub fn with_headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    /// Replace the reconnect backoff calculation.
    #[must_use]
    pub fn with_reconnect_after(
        mut self,
        calc: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.reconnect_after = Arc::new(calc);
        self
    }

    /// Replace the rejoin backoff calculation.
    #[must_use]
    pub fn with_rejoin_after(
        mut self,
        calc: impl Fn(u32) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.rejoin_after = Arc::new(calc);
        self
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SocketOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketOptions")
            .field("timeout", &self.timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .field("skip_heartbeat", &self.skip_heartbeat)
            .field("params", &self.params)
            .field("headers", &self.headers)
            .finish()
    }
}

// ── Shared state ────────────────────────────────────────────────────

type OpenCallback = Arc<dyn Fn() + Send + Sync>;
type CloseCallback = Arc<dyn Fn(Option<u16>, Option<&str>) + Send + Sync>;
type ErrorCallback = Arc<dyn Fn(&PhoenixError) + Send + Sync>;
type SocketMessageCallback = Arc<dyn Fn(&Message) + Send + Sync>;

/// State-change callback tables, each keyed by subscription ref.
struct StateCallbacks {
    open: SyncArray<(String, OpenCallback)>,
    close: SyncArray<(String, CloseCallback)>,
    error: SyncArray<(String, ErrorCallback)>,
    message: SyncArray<(String, SocketMessageCallback)>,
}

impl StateCallbacks {
    fn new() -> Self {
        Self {
            open: SyncArray::new(),
            close: SyncArray::new(),
            error: SyncArray::new(),
            message: SyncArray::new(),
        }
    }
}

enum ConnCommand {
    Frame(Frame),
    Close { code: u16, reason: Option<String> },
}

struct ConnHandle {
    cmd_tx: mpsc::UnboundedSender<ConnCommand>,
    task: Option<JoinHandle<()>>,
}

struct BufferedSend {
    msg_ref: Option<String>,
    frame: Frame,
}

pub(crate) struct SocketCore {
    /// Normalized endpoint (scheme mapped to ws/wss, path ending in
    /// `/websocket`), without query parameters.
    endpoint: Url,
    params: ConnectParams,
    headers: Vec<(String, String)>,
    connector: Box<dyn Connector>,
    serializer: Serializer,
    timeout: Duration,
    heartbeat_interval: Duration,
    skip_heartbeat: bool,
    rejoin_after: BackoffCalc,
    ref_counter: AtomicU64,
    pending_heartbeat_ref: Mutex<Option<String>>,
    close_status: Mutex<CloseStatus>,
    connection_state: Mutex<ConnectionState>,
    channels: Mutex<Vec<Arc<ChannelCore>>>,
    send_buffer: Mutex<Vec<BufferedSend>>,
    callbacks: StateCallbacks,
    reconnect_timer: TimeoutTimer,
    heartbeat: Mutex<Option<HeartbeatTimer>>,
    conn: Mutex<Option<ConnHandle>>,
}

impl SocketCore {
    // ── Connect / disconnect ────────────────────────────────────────

    pub(crate) async fn connect(self: &Arc<Self>) -> Result<(), PhoenixError> {
        {
            let mut state = lock(&self.connection_state);
            match *state {
                ConnectionState::Closed => *state = ConnectionState::Connecting,
                // Already connecting, open, or closing.
                _ => return Ok(()),
            }
        }
        *lock(&self.close_status) = CloseStatus::Unknown;

        let url = self.endpoint_url();
        debug!(url = %url, "connecting");
        match self.connector.connect(&url, &self.headers).await {
            Ok(transport) => {
                let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_connection(Arc::downgrade(self), transport, cmd_rx));
                *lock(&self.conn) = Some(ConnHandle {
                    cmd_tx,
                    task: Some(task),
                });
                self.on_conn_open();
                Ok(())
            }
            Err(e) => {
                error!(url = %url, error = %e, "connection failed");
                self.set_connection_state(ConnectionState::Closed);
                self.on_conn_error(&e);
                if lock(&self.close_status).should_reconnect() {
                    self.reconnect_timer.schedule_timeout();
                }
                Err(e)
            }
        }
    }

    pub(crate) async fn disconnect(&self, code: u16, reason: Option<String>) {
        *lock(&self.close_status) = CloseStatus::from_code(Some(code));
        self.reconnect_timer.reset();
        self.teardown(code, reason).await;
    }

    /// Close the current transport, if any, and wait for the connection task
    /// to run its close path.
    async fn teardown(&self, code: u16, reason: Option<String>) {
        let Some(mut handle) = lock(&self.conn).take() else {
            return;
        };
        self.set_connection_state(ConnectionState::Closing);
        let _ = handle.cmd_tx.send(ConnCommand::Close { code, reason });
        if let Some(task) = handle.task.take() {
            let _ = task.await;
        }
    }

    /// The socket chose to close but intends to come back: record the close
    /// as abnormal, then disconnect the transport with a normal code.
    fn abnormal_close(&self, reason: &str) {
        *lock(&self.close_status) = CloseStatus::Abnormal;
        if let Some(handle) = lock(&self.conn).as_ref() {
            let _ = handle.cmd_tx.send(ConnCommand::Close {
                code: CLOSE_NORMAL,
                reason: Some(reason.to_string()),
            });
        }
    }

    // ── Connection events ───────────────────────────────────────────

    fn on_conn_open(self: &Arc<Self>) {
        debug!(endpoint = %self.endpoint, "transport open");
        self.set_connection_state(ConnectionState::Open);
        self.flush_send_buffer();
        self.reconnect_timer.reset();
        self.reset_heartbeat();
        for (_, callback) in self.callbacks.open.snapshot().iter() {
            callback();
        }
    }

    fn on_conn_close(&self, code: Option<u16>, reason: Option<String>) {
        debug!(?code, ?reason, "transport closed");
        lock(&self.conn).take();
        self.set_connection_state(ConnectionState::Closed);
        self.trigger_chan_error();
        if let Some(timer) = lock(&self.heartbeat).take() {
            timer.stop();
        }
        let should_reconnect = {
            let mut status = lock(&self.close_status);
            status.update(code);
            status.should_reconnect()
        };
        if should_reconnect {
            self.reconnect_timer.schedule_timeout();
        }
        for (_, callback) in self.callbacks.close.snapshot().iter() {
            callback(code, reason.as_deref());
        }
    }

    fn on_conn_error(&self, error: &PhoenixError) {
        for (_, callback) in self.callbacks.error.snapshot().iter() {
            callback(error);
        }
        self.trigger_chan_error();
    }

    fn on_conn_message(&self, frame: Frame) {
        let message = match self.serializer.decode(&frame) {
            Ok(message) => message,
            Err(decode_error) => {
                let error = PhoenixError::Decode {
                    error: decode_error,
                    bytes: frame.as_bytes().to_vec(),
                };
                error!(error = %error, "dropping undecodable frame");
                for (_, callback) in self.callbacks.error.snapshot().iter() {
                    callback(&error);
                }
                return;
            }
        };

        {
            let mut pending = lock(&self.pending_heartbeat_ref);
            if pending.is_some() && *pending == message.msg_ref {
                *pending = None;
            }
        }

        debug!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            "received"
        );

        let channels: Vec<Arc<ChannelCore>> = lock(&self.channels).clone();
        for channel in channels {
            if channel.is_member(&message) {
                channel.trigger(message.clone());
            }
        }
        for (_, callback) in self.callbacks.message.snapshot().iter() {
            callback(&message);
        }
    }

    /// Convert a transport-level failure into `phx_error` on every channel
    /// that is not already errored, leaving, or closed.
    fn trigger_chan_error(&self) {
        let channels: Vec<Arc<ChannelCore>> = lock(&self.channels).clone();
        for channel in channels {
            if !matches!(
                channel.state(),
                ChannelState::Errored | ChannelState::Leaving | ChannelState::Closed
            ) {
                channel.trigger(Message::broadcast(
                    channel.topic().to_string(),
                    PHX_ERROR,
                    Payload::empty(),
                ));
            }
        }
    }

    // ── Heartbeat ───────────────────────────────────────────────────

    fn reset_heartbeat(self: &Arc<Self>) {
        *lock(&self.pending_heartbeat_ref) = None;
        let mut heartbeat = lock(&self.heartbeat);
        if let Some(timer) = heartbeat.take() {
            timer.stop();
        }
        if self.skip_heartbeat {
            return;
        }
        let timer = HeartbeatTimer::new(self.heartbeat_interval);
        let target: Weak<SocketCore> = Arc::downgrade(self);
        timer.start(move || {
            if let Some(core) = target.upgrade() {
                core.send_heartbeat();
            }
        });
        *heartbeat = Some(timer);
    }

    fn send_heartbeat(&self) {
        if !self.is_connected() {
            return;
        }
        let msg_ref = {
            let mut pending = lock(&self.pending_heartbeat_ref);
            if pending.take().is_some() {
                warn!("heartbeat timeout: no reply to previous heartbeat, closing connection");
                drop(pending);
                self.abnormal_close("heartbeat timeout");
                return;
            }
            let msg_ref = self.make_ref();
            *pending = Some(msg_ref.clone());
            msg_ref
        };
        self.push_message(Message::message(
            None,
            Some(msg_ref),
            PHOENIX_TOPIC,
            HEARTBEAT_EVENT,
            Payload::empty(),
        ));
    }

    // ── Outbound ────────────────────────────────────────────────────

    /// Encode and send a message, or buffer it while disconnected.
    ///
    /// # Panics
    ///
    /// Panics if the message cannot be encoded; outbound payloads are
    /// produced by the caller, so this is a programming error.
    #[allow(clippy::panic)]
    pub(crate) fn push_message(&self, message: Message) {
        let frame = match self.serializer.encode(&message) {
            Ok(frame) => frame,
            Err(e) => panic!(
                "failed to encode outbound push for topic {:?}: {e}",
                message.topic
            ),
        };
        debug!(
            topic = %message.topic,
            event = %message.event,
            msg_ref = ?message.msg_ref,
            join_ref = ?message.join_ref,
            "push"
        );
        if self.is_connected() {
            self.send_frame(frame);
        } else {
            lock(&self.send_buffer).push(BufferedSend {
                msg_ref: message.msg_ref.clone(),
                frame,
            });
        }
    }

    fn send_frame(&self, frame: Frame) {
        if let Some(handle) = lock(&self.conn).as_ref() {
            let _ = handle.cmd_tx.send(ConnCommand::Frame(frame));
        }
    }

    fn flush_send_buffer(&self) {
        if !self.is_connected() {
            return;
        }
        let buffered = std::mem::take(&mut *lock(&self.send_buffer));
        if buffered.is_empty() {
            return;
        }
        debug!(count = buffered.len(), "flushing send buffer");
        for entry in buffered {
            self.send_frame(entry.frame);
        }
    }

    pub(crate) fn remove_from_send_buffer(&self, msg_ref: &str) {
        lock(&self.send_buffer).retain(|entry| entry.msg_ref.as_deref() != Some(msg_ref));
    }

    // ── Refs ────────────────────────────────────────────────────────

    /// Next message reference. Wraps to 0 at `u64::MAX`.
    pub(crate) fn make_ref(&self) -> String {
        let next = self.ref_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        next.to_string()
    }

    // ── Channel registry ────────────────────────────────────────────

    /// Ask any *other* channel on this topic that is joined or joining to
    /// leave, keeping at most one open channel per topic.
    pub(crate) fn leave_open_topic(&self, topic: &str, keeping: &Arc<ChannelCore>) {
        let channels: Vec<Arc<ChannelCore>> = lock(&self.channels).clone();
        for channel in channels {
            if channel.topic() == topic
                && matches!(channel.state(), ChannelState::Joined | ChannelState::Joining)
                && !Arc::ptr_eq(&channel, keeping)
            {
                warn!(topic = %topic, "leaving duplicate topic");
                channel.leave(None);
            }
        }
    }

    /// Unsubscribe the channel's socket callbacks and drop it from the list.
    pub(crate) fn remove_channel(&self, channel: &Arc<ChannelCore>) {
        self.off(&channel.socket_hook_refs());
        lock(&self.channels).retain(|other| !Arc::ptr_eq(other, channel));
    }

    // ── Callback tables ─────────────────────────────────────────────

    pub(crate) fn register_open_hook(&self, callback: OpenCallback) -> String {
        let cb_ref = self.make_ref();
        self.callbacks.open.push((cb_ref.clone(), callback));
        cb_ref
    }

    pub(crate) fn register_error_hook(&self, callback: ErrorCallback) -> String {
        let cb_ref = self.make_ref();
        self.callbacks.error.push((cb_ref.clone(), callback));
        cb_ref
    }

    fn register_close_hook(&self, callback: CloseCallback) -> String {
        let cb_ref = self.make_ref();
        self.callbacks.close.push((cb_ref.clone(), callback));
        cb_ref
    }

    fn register_message_hook(&self, callback: SocketMessageCallback) -> String {
        let cb_ref = self.make_ref();
        self.callbacks.message.push((cb_ref.clone(), callback));
        cb_ref
    }

    fn off(&self, refs: &[String]) {
        self.callbacks.open.retain(|(r, _)| !refs.contains(r));
        self.callbacks.close.retain(|(r, _)| !refs.contains(r));
        self.callbacks.error.retain(|(r, _)| !refs.contains(r));
        self.callbacks.message.retain(|(r, _)| !refs.contains(r));
    }

    fn release_callbacks(&self) {
        self.callbacks.open.clear();
        self.callbacks.close.clear();
        self.callbacks.error.clear();
        self.callbacks.message.clear();
    }

    // ── State accessors ─────────────────────────────────────────────

    pub(crate) fn is_connected(&self) -> bool {
        *lock(&self.connection_state) == ConnectionState::Open
    }

    fn set_connection_state(&self, state: ConnectionState) {
        *lock(&self.connection_state) = state;
    }

    pub(crate) fn default_timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn rejoin_after(&self) -> BackoffCalc {
        Arc::clone(&self.rejoin_after)
    }

    /// The full connect URL: normalized endpoint plus `vsn` and the
    /// (possibly dynamic) user params.
    fn endpoint_url(&self) -> Url {
        let mut url = self.endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("vsn", VSN);
            for (name, value) in self.params.resolve() {
                query.append_pair(&name, &value);
            }
        }
        url
    }
}

impl std::fmt::Debug for SocketCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &*lock(&self.connection_state))
            .field("channels", &lock(&self.channels).len())
            .finish()
    }
}

// ── Connection task ─────────────────────────────────────────────────

/// Per-transport-session loop: multiplexes outgoing commands and inbound
/// frames, then runs the close path exactly once on exit.
///
/// Transport errors are surfaced but do not end the session; only a close
/// command or the transport reporting closure does.
async fn run_connection(
    core: Weak<SocketCore>,
    mut transport: Box<dyn Transport>,
    mut cmd_rx: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let mut requested_close: Option<(u16, Option<String>)> = None;
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(ConnCommand::Frame(frame)) => {
                    if let Err(e) = transport.send(frame).await {
                        error!(error = %e, "transport send error");
                        let Some(core) = core.upgrade() else { break };
                        core.on_conn_error(&e);
                    }
                }
                Some(ConnCommand::Close { code, reason }) => {
                    let _ = transport.close(code, reason.clone()).await;
                    requested_close = Some((code, reason));
                    break;
                }
                // Socket dropped; close out the transport.
                None => {
                    let _ = transport.close(CLOSE_NORMAL, None).await;
                    break;
                }
            },
            incoming = transport.recv() => match incoming {
                Some(Ok(frame)) => {
                    let Some(core) = core.upgrade() else { break };
                    core.on_conn_message(frame);
                }
                Some(Err(e)) => {
                    error!(error = %e, "transport receive error");
                    let Some(core) = core.upgrade() else { break };
                    core.on_conn_error(&e);
                }
                None => break,
            },
        }
    }

    if let Some(core) = core.upgrade() {
        let (code, reason) = match requested_close {
            Some((code, reason)) => (Some(code), reason),
            None => (transport.close_code(), None),
        };
        core.on_conn_close(code, reason);
    }
}

// ── Endpoint normalization ──────────────────────────────────────────

/// Normalize a user-supplied endpoint: map the scheme onto `ws`/`wss`
/// (secure schemes stay secure, anything else becomes `ws`), default the
/// scheme when missing, and make the path end in `/websocket`.
///
/// # Panics
///
/// Panics when the endpoint cannot be parsed as a URL; a malformed endpoint
/// is a programming error.
#[allow(clippy::panic)]
fn build_endpoint(raw: &str) -> Url {
    let with_scheme = match raw.split_once("://") {
        Some((scheme, rest)) => {
            let scheme = match scheme {
                "wss" | "https" => "wss",
                _ => "ws",
            };
            format!("{scheme}://{rest}")
        }
        None => format!("ws://{raw}"),
    };
    let mut url = match Url::parse(&with_scheme) {
        Ok(url) => url,
        Err(e) => panic!("malformed endpoint URL {raw:?}: {e}"),
    };
    if !url.path().ends_with("/websocket") {
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}/websocket"));
    }
    url
}

// ── Public handle ───────────────────────────────────────────────────

/// Handle to one logical connection multiplexing many channels.
///
/// # Example
///
/// ```rust,no_run
/// # #[cfg(feature = "transport-websocket")]
/// # async fn example() -> Result<(), phoenix_channel_client::PhoenixError> {
/// use phoenix_channel_client::{Socket, SocketOptions};
///
/// let socket = Socket::with_websocket(
///     "https://example.com/socket",
///     SocketOptions::new().with_params(vec![("token".into(), "abc123".into())]),
/// );
/// socket.connect().await?;
///
/// let channel = socket.channel("room:lobby", serde_json::json!({}));
/// channel
///     .join(None)
///     .receive("ok", |_| println!("joined"))
///     .receive("error", |reply| println!("refused: {reply:?}"));
/// # Ok(())
/// # }
/// ```
pub struct Socket {
    core: Arc<SocketCore>,
}

impl Socket {
    /// Create a socket for `endpoint` using the given transport factory.
    ///
    /// The endpoint is normalized immediately: `https` → `wss`, any other
    /// scheme (or none) → `ws`, and the path is made to end in `/websocket`.
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` cannot be parsed as a URL.
    pub fn new(endpoint: &str, connector: impl Connector, options: SocketOptions) -> Self {
        let endpoint = build_endpoint(endpoint);
        let reconnect_calc = Arc::clone(&options.reconnect_after);

        let core = Arc::new_cyclic(|weak: &Weak<SocketCore>| {
            let reconnect_target = weak.clone();
            let reconnect_timer = TimeoutTimer::new(reconnect_calc, move || {
                let Some(core) = reconnect_target.upgrade() else {
                    return;
                };
                tokio::spawn(async move {
                    core.teardown(CLOSE_NORMAL, Some("reconnection".into())).await;
                    if let Err(e) = core.connect().await {
                        debug!(error = %e, "reconnect attempt failed");
                    }
                });
            });

            SocketCore {
                endpoint,
                params: options.params.clone(),
                headers: options.headers.clone(),
                connector: Box::new(connector),
                serializer: Serializer,
                timeout: options.timeout,
                heartbeat_interval: options.heartbeat_interval,
                skip_heartbeat: options.skip_heartbeat,
                rejoin_after: Arc::clone(&options.rejoin_after),
                ref_counter: AtomicU64::new(0),
                pending_heartbeat_ref: Mutex::new(None),
                close_status: Mutex::new(CloseStatus::Unknown),
                connection_state: Mutex::new(ConnectionState::Closed),
                channels: Mutex::new(Vec::new()),
                send_buffer: Mutex::new(Vec::new()),
                callbacks: StateCallbacks::new(),
                reconnect_timer,
                heartbeat: Mutex::new(None),
                conn: Mutex::new(None),
            }
        });

        Self { core }
    }

    /// Create a socket backed by the built-in WebSocket transport.
    ///
    /// # Panics
    ///
    /// Panics if `endpoint` cannot be parsed as a URL.
    #[cfg(feature = "transport-websocket")]
    pub fn with_websocket(endpoint: &str, options: SocketOptions) -> Self {
        Self::new(
            endpoint,
            crate::transports::WebSocketConnector::new(),
            options,
        )
    }

    /// Establish the transport. Idempotent while connecting or open.
    ///
    /// On failure the error is also reported to the `on_error` callbacks and
    /// a reconnect is scheduled, so callers may simply log it.
    ///
    /// # Errors
    ///
    /// Returns the connection error from the transport factory.
    pub async fn connect(&self) -> Result<(), PhoenixError> {
        self.core.connect().await
    }

    /// Close the connection on purpose. No reconnect is scheduled.
    ///
    /// `code` defaults to 1000 (normal closure). Completes after the close
    /// callbacks have run.
    pub async fn disconnect(&self, code: Option<u16>, reason: Option<String>) {
        self.core
            .disconnect(code.unwrap_or(CLOSE_NORMAL), reason)
            .await;
    }

    /// Create a channel for `topic` with the given join payload.
    pub fn channel(&self, topic: impl Into<String>, params: serde_json::Value) -> Channel {
        let core = ChannelCore::new(&self.core, topic.into(), params);
        lock(&self.core.channels).push(Arc::clone(&core));
        Channel { core }
    }

    /// Subscribe to transport open. Returns a subscription ref for
    /// [`off`](Self::off).
    pub fn on_open(&self, callback: impl Fn() + Send + Sync + 'static) -> String {
        self.core.register_open_hook(Arc::new(callback))
    }

    /// Subscribe to transport close, with the close code and reason when
    /// known.
    pub fn on_close(
        &self,
        callback: impl Fn(Option<u16>, Option<&str>) + Send + Sync + 'static,
    ) -> String {
        self.core.register_close_hook(Arc::new(callback))
    }

    /// Subscribe to transport and decode errors.
    pub fn on_error(&self, callback: impl Fn(&PhoenixError) + Send + Sync + 'static) -> String {
        self.core.register_error_hook(Arc::new(callback))
    }

    /// Subscribe to every decoded inbound message.
    pub fn on_message(&self, callback: impl Fn(&Message) + Send + Sync + 'static) -> String {
        self.core.register_message_hook(Arc::new(callback))
    }

    /// Remove the subscriptions with the given refs from all tables.
    pub fn off(&self, refs: &[String]) {
        self.core.off(refs);
    }

    /// Remove every state-change subscription.
    pub fn release_callbacks(&self) {
        self.core.release_callbacks();
    }

    /// Whether the transport is currently open.
    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    /// The observable connection state.
    pub fn connection_state(&self) -> ConnectionState {
        *lock(&self.core.connection_state)
    }

    /// The full connect URL, including `vsn` and user params.
    pub fn endpoint_url(&self) -> Url {
        self.core.endpoint_url()
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.core.fmt(f)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopConnector;

    #[async_trait]
    impl Connector for NoopConnector {
        async fn connect(
            &self,
            _url: &Url,
            _headers: &[(String, String)],
        ) -> Result<Box<dyn Transport>, PhoenixError> {
            Err(PhoenixError::NotConnected)
        }
    }

    fn socket(endpoint: &str, options: SocketOptions) -> Socket {
        Socket::new(endpoint, NoopConnector, options)
    }

    #[test]
    fn https_endpoint_becomes_wss_with_websocket_path() {
        let socket = socket("https://example.com/chat", SocketOptions::new());
        assert_eq!(
            socket.endpoint_url().as_str(),
            "wss://example.com/chat/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn trailing_slash_is_collapsed_before_websocket_path() {
        let socket = socket("ws://example.com/chat/", SocketOptions::new());
        assert_eq!(
            socket.endpoint_url().as_str(),
            "ws://example.com/chat/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn http_endpoint_becomes_ws_and_params_follow_vsn() {
        let socket = socket(
            "http://example.com/chat",
            SocketOptions::new().with_params(vec![("token".into(), "abc123".into())]),
        );
        assert_eq!(
            socket.endpoint_url().as_str(),
            "ws://example.com/chat/websocket?vsn=2.0.0&token=abc123"
        );
    }

    #[test]
    fn missing_scheme_defaults_to_ws() {
        let socket = socket("example.com/chat", SocketOptions::new());
        assert_eq!(
            socket.endpoint_url().as_str(),
            "ws://example.com/chat/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn existing_websocket_path_is_not_duplicated() {
        let socket = socket("wss://example.com/socket/websocket", SocketOptions::new());
        assert_eq!(
            socket.endpoint_url().as_str(),
            "wss://example.com/socket/websocket?vsn=2.0.0"
        );
    }

    #[test]
    fn dynamic_params_are_reevaluated_per_call() {
        let counter = Arc::new(AtomicU64::new(0));
        let source = Arc::clone(&counter);
        let socket = socket(
            "ws://example.com/chat",
            SocketOptions::new().with_dynamic_params(move || {
                let n = source.fetch_add(1, Ordering::SeqCst);
                vec![("attempt".into(), n.to_string())]
            }),
        );
        assert!(socket.endpoint_url().as_str().ends_with("attempt=0"));
        assert!(socket.endpoint_url().as_str().ends_with("attempt=1"));
    }

    #[test]
    #[should_panic(expected = "malformed endpoint URL")]
    fn malformed_endpoint_is_fatal() {
        let _ = socket("ws://exa mple com:not-a-port/", SocketOptions::new());
    }

    #[test]
    fn make_ref_is_monotone_and_wraps_at_max() {
        let socket = socket("ws://example.com/chat", SocketOptions::new());
        assert_eq!(socket.core.make_ref(), "1");
        assert_eq!(socket.core.make_ref(), "2");

        socket.core.ref_counter.store(u64::MAX, Ordering::SeqCst);
        assert_eq!(socket.core.make_ref(), "0");
        assert_eq!(socket.core.make_ref(), "1");
    }

    #[test]
    fn close_status_reconnect_policy() {
        assert!(CloseStatus::Unknown.should_reconnect());
        assert!(CloseStatus::Abnormal.should_reconnect());
        assert!(!CloseStatus::Clean.should_reconnect());
        assert!(!CloseStatus::Custom(4000).should_reconnect());
    }

    #[test]
    fn close_status_update_only_refines_unknown() {
        let mut status = CloseStatus::Unknown;
        status.update(Some(CLOSE_NORMAL));
        assert_eq!(status, CloseStatus::Clean);

        let mut status = CloseStatus::Abnormal;
        status.update(Some(CLOSE_NORMAL));
        assert_eq!(status, CloseStatus::Abnormal);

        let mut status = CloseStatus::Unknown;
        status.update(None);
        assert_eq!(status, CloseStatus::Unknown);

        let mut status = CloseStatus::Unknown;
        status.update(Some(CLOSE_ABNORMAL));
        assert_eq!(status, CloseStatus::Abnormal);
    }

    #[test]
    fn initial_connection_state_is_closed() {
        let socket = socket("ws://example.com/chat", SocketOptions::new());
        assert_eq!(socket.connection_state(), ConnectionState::Closed);
        assert!(!socket.is_connected());
    }
}
