//! One CoT connection: read pump, write pump, protocol negotiation, timers.
//!
//! # Lifecycle
//!
//! ```text
//! Connecting ──start──▶ Negotiating ──version accepted──▶ UpgradedBinary
//!      │                     │                                  │
//!      └─────────────────────┴──────────── stop() ──────────────┴──▶ Closed
//! ```
//!
//! Every connection starts on markup.  A server-role session advertises
//! protocol version 1 and upgrades when the client asks for it; a
//! client-role session (the upstream connector) waits for the
//! advertisement, requests version 1 and upgrades when the server agrees.
//! The upgrade never goes back.
//!
//! # Tasks
//!
//! [`Session::start`] spawns:
//!
//! - **read pump** – reads markup elements or binary frames (depending on
//!   the current version) from one shared buffered reader, so bytes
//!   buffered across the upgrade are not lost;
//! - **write pump** – drains the bounded outbound queue in order;
//! - **idle watchdog** – closes the transport when nothing has been read for
//!   `idle_timeout`;
//! - **keep-alive** (client role only) – pings when nothing was written
//!   during the last `ping_interval`.
//!
//! Closing the transport is a `watch` signal every task selects on.
//! Teardown ([`Session::stop`]) runs exactly once no matter which task
//! notices the end first.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use cot_core::protocol::control::{self, Control};
use cot_core::protocol::{CodecError, FrameError, FrameReader, TagReader, EVENT_TAG};
use cot_core::{Codec, CotMessage, PROTO_VERSION, XML_VERSION};
use dashmap::DashMap;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::relay::MessageHandler;
use crate::application::routing::{Outbound, Peer, RoutingHub};
use crate::application::scope::{Access, ScopePolicy};

/// Errors surfaced by a session.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The stream could not be read or framed.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// A complete element or frame did not decode to an event.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// The session has been stopped.
    #[error("session is closed")]
    Closed,

    /// The outbound queue is full; the message was dropped.
    #[error("outbound queue full")]
    QueueFull,
}

impl SessionError {
    /// True when the read pump must give up on the connection.
    pub fn is_fatal(&self) -> bool {
        match self {
            SessionError::Frame(e) => e.is_fatal(),
            SessionError::Codec(_) | SessionError::QueueFull => false,
            SessionError::Closed => true,
        }
    }
}

// ── Configuration ─────────────────────────────────────────────────────────────

/// Which side of the negotiation this session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Accepted connection: advertises and grants protocol upgrades.
    Server,
    /// Outgoing connection to another relay: requests upgrades and pings.
    Client,
}

/// Tunables shared by every session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub ping_interval: Duration,
    pub queue_capacity: usize,
    pub max_tag_len: usize,
    pub max_frame_len: usize,
    /// Hand pings to the message handler after answering them.
    pub route_pings: bool,
    /// Deliver chat from other scopes, stripped of coordinates.
    pub interscope_chat: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            ping_interval: Duration::from_secs(15),
            queue_capacity: 10,
            max_tag_len: cot_core::protocol::DEFAULT_MAX_TAG_LEN,
            max_frame_len: cot_core::protocol::DEFAULT_MAX_FRAME_LEN,
            route_pings: false,
            interscope_chat: false,
        }
    }
}

/// Everything a session needs from the rest of the relay.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Arc<RoutingHub>,
    pub handler: Arc<dyn MessageHandler>,
    pub policy: Arc<dyn ScopePolicy>,
    pub settings: SessionSettings,
    /// Uid this relay pings with when acting as a client.
    pub local_uid: String,
}

// ── State ─────────────────────────────────────────────────────────────────────

/// Observable session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Negotiating = 1,
    UpgradedBinary = 2,
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Connecting,
            1 => SessionState::Negotiating,
            2 => SessionState::UpgradedBinary,
            _ => SessionState::Closed,
        }
    }
}

// ── Session ───────────────────────────────────────────────────────────────────

/// A single CoT connection.
pub struct Session {
    name: String,
    role: Role,
    access: Access,
    local_uid: String,
    settings: SessionSettings,
    codec: Codec,
    state: AtomicU8,
    /// uid → callsign of every contact announced on this connection.
    contacts: DashMap<String, String>,
    queue: Mutex<Option<mpsc::Sender<Bytes>>>,
    shutdown: watch::Sender<bool>,
    epoch: Instant,
    /// Milliseconds since `epoch` of the last successful read.
    last_read: AtomicU64,
    /// Milliseconds since `epoch` of the last successful write.
    last_write: AtomicU64,
    hub: Arc<RoutingHub>,
    handler: Arc<dyn MessageHandler>,
    policy: Arc<dyn ScopePolicy>,
}

impl Session {
    /// Registers a session for `stream` with the hub and spawns its tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<S>(
        stream: S,
        name: impl Into<String>,
        role: Role,
        access: Access,
        ctx: &SessionContext,
    ) -> Arc<Session>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ctx.settings.queue_capacity.max(1));
        let (shutdown, _) = watch::channel(false);

        let session = Arc::new(Session {
            name: name.into(),
            role,
            access,
            local_uid: ctx.local_uid.clone(),
            settings: ctx.settings.clone(),
            codec: ctx.hub.codec().clone(),
            state: AtomicU8::new(SessionState::Connecting as u8),
            contacts: DashMap::new(),
            queue: Mutex::new(Some(tx)),
            shutdown,
            epoch: Instant::now(),
            last_read: AtomicU64::new(0),
            last_write: AtomicU64::new(0),
            hub: Arc::clone(&ctx.hub),
            handler: Arc::clone(&ctx.handler),
            policy: Arc::clone(&ctx.policy),
        });

        let peer: Weak<dyn Peer> = Arc::downgrade(&session) as Weak<dyn Peer>;
        session.hub.register(&session.name, peer);
        info!(
            "session {}: started as {:?} (user {:?}, scope {:?})",
            session.name, role, session.access.user, session.access.scope
        );

        session.transition(SessionState::Connecting, SessionState::Negotiating);
        if role == Role::Server {
            debug!("session {}: advertising protocol v{PROTO_VERSION}", session.name);
            session.send_msg(&control::version_support(PROTO_VERSION));
        }

        let (reader, writer) = tokio::io::split(stream);
        tokio::spawn(Arc::clone(&session).write_loop(writer, rx));
        tokio::spawn(Arc::clone(&session).read_loop(reader));
        tokio::spawn(Arc::clone(&session).watchdog_loop());
        if role == Role::Client {
            tokio::spawn(Arc::clone(&session).keepalive_loop());
        }

        session
    }

    // ── Accessors ─────────────────────────────────────────────────────────────

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn access(&self) -> &Access {
        &self.access
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Protocol version used for both directions right now.
    pub fn version(&self) -> u32 {
        match self.state() {
            SessionState::UpgradedBinary => PROTO_VERSION,
            _ => XML_VERSION,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state() != SessionState::Closed
    }

    /// Uid of the contact using `callsign`, if any.
    pub fn uid_for_callsign(&self, callsign: &str) -> Option<String> {
        self.contacts
            .iter()
            .find(|entry| entry.value() == callsign)
            .map(|entry| entry.key().clone())
    }

    /// Snapshot of `(uid, callsign)` for every contact on this connection.
    pub fn contacts(&self) -> Vec<(String, String)> {
        self.contacts
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn has_uid(&self, uid: &str) -> bool {
        self.contacts.contains_key(uid)
    }

    /// Resolves once the session has been closed.
    pub async fn closed(&self) {
        signalled(&mut self.shutdown.subscribe()).await;
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn at(&self, ms: &AtomicU64) -> Instant {
        self.epoch + Duration::from_millis(ms.load(Ordering::Relaxed))
    }

    fn touch_read(&self) {
        self.last_read.store(self.now_ms(), Ordering::Relaxed);
    }

    // ── Sending ───────────────────────────────────────────────────────────────

    /// Queues `msg` for this connection, subject to scope visibility.
    /// Returns true when the message was queued.
    pub fn send_msg(&self, msg: &CotMessage) -> bool {
        self.deliver(&Outbound::new(msg, &self.codec))
    }

    /// The outbound queue.  The protocol version only changes while this lock
    /// is held, and senders read it under the same lock, so the queue never
    /// holds a markup element behind the frame that switched to binary.
    fn queue(&self) -> MutexGuard<'_, Option<mpsc::Sender<Bytes>>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Grants the client's upgrade request: queues the markup response and
    /// switches to binary in one step.
    fn accept_upgrade(&self) -> bool {
        let response = control::version_response(true);
        let out = Outbound::new(&response, &self.codec);

        let queue = self.queue();
        let Some(bytes) = out.encoded(XML_VERSION) else {
            return false;
        };
        match push(queue.as_ref(), bytes) {
            Ok(()) => self.transition(SessionState::Negotiating, SessionState::UpgradedBinary),
            Err(e) => {
                debug!("session {}: cannot answer version request: {e}", self.name);
                false
            }
        }
    }

    // ── Read pump ─────────────────────────────────────────────────────────────

    async fn read_loop<R>(self: Arc<Self>, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut shutdown = self.shutdown.subscribe();
        let mut buf = BufReader::new(reader);

        loop {
            let next = tokio::select! {
                _ = signalled(&mut shutdown) => break,
                next = self.read_message(&mut buf) => next,
            };

            match next {
                Ok(Some(msg)) => self.process(msg).await,
                Ok(None) => {}
                Err(SessionError::Frame(FrameError::Eof)) => {
                    info!("session {}: connection closed by peer", self.name);
                    break;
                }
                Err(e) if e.is_fatal() => {
                    warn!("session {}: {e}", self.name);
                    break;
                }
                Err(e) => warn!("session {}: skipping input: {e}", self.name),
            }
        }

        self.stop().await;
    }

    /// Reads one unit with the reader for the current version.  Returns
    /// `None` for markup that carries no event (declaration, auth, comments).
    async fn read_message<R>(
        &self,
        buf: &mut BufReader<R>,
    ) -> Result<Option<CotMessage>, SessionError>
    where
        R: AsyncRead + Unpin,
    {
        if self.version() >= PROTO_VERSION {
            let payload = FrameReader::new(&mut *buf)
                .with_max_len(self.settings.max_frame_len)
                .read_frame()
                .await?;
            self.touch_read();
            return Ok(Some(self.codec.decode_binary(&payload)?));
        }

        let tag = TagReader::new(&mut *buf)
            .with_max_len(self.settings.max_tag_len)
            .read_tag()
            .await?;
        self.touch_read();
        if tag.name == EVENT_TAG {
            return Ok(Some(self.codec.decode_xml(&tag.name, &tag.data)?));
        }
        if tag.name == "?xml" || tag.name == "auth" || tag.name.starts_with('!') {
            return Ok(None);
        }
        Err(CodecError::UnexpectedTag(tag.name).into())
    }

    async fn process(&self, mut msg: CotMessage) {
        msg.from = self.name.clone();
        msg.scope = self.access.scope.clone();

        if msg.is_contact() {
            let uid = control::base_uid(msg.uid());
            let callsign = msg.callsign();
            if self.contacts.insert(uid.to_string(), callsign.to_string()).is_none() {
                if let Some(prev) = self.hub.claim_uid(uid, &self.name) {
                    debug!("session {}: uid {uid} moved from {prev}", self.name);
                }
                self.handler.on_new_contact(&self.name, uid, callsign).await;
            }
        }

        match Control::classify(&msg) {
            Some(Control::Ping { base_uid }) => {
                debug!("session {}: ping from {base_uid}", self.name);
                self.send_msg(&control::pong(base_uid));
                if !self.settings.route_pings {
                    return;
                }
            }
            Some(Control::Pong) => return,
            Some(Control::RemoveLink { uid: Some(uid) }) => {
                debug!("session {}: removing uid {uid} by message", self.name);
                self.contacts.remove(uid);
                self.hub.release_uid(uid, &self.name);
            }
            Some(c) if c.is_negotiation() => {
                self.negotiate(&c);
                return;
            }
            _ => {}
        }

        self.handler.on_message(msg).await;
    }

    fn negotiate(&self, control: &Control<'_>) {
        let negotiating = self.state() == SessionState::Negotiating;
        match (self.role, control) {
            (Role::Server, Control::VersionRequest(version)) if negotiating => {
                if *version == Some(PROTO_VERSION) {
                    if self.accept_upgrade() {
                        info!("session {}: switched to protocol v{PROTO_VERSION}", self.name);
                    }
                } else {
                    warn!("session {}: refusing protocol version {version:?}", self.name);
                    self.send_msg(&control::version_response(false));
                }
            }
            (Role::Client, Control::VersionSupport(version)) if negotiating => {
                info!("session {}: server supports protocol v{version}", self.name);
                if *version >= PROTO_VERSION {
                    self.send_msg(&control::version_request(PROTO_VERSION));
                }
            }
            (Role::Client, Control::VersionResponse(accepted)) if negotiating => {
                if *accepted {
                    let _queue = self.queue();
                    if self.transition(SessionState::Negotiating, SessionState::UpgradedBinary) {
                        info!("session {}: switched to protocol v{PROTO_VERSION}", self.name);
                    }
                } else {
                    warn!("session {}: server refused protocol upgrade", self.name);
                }
            }
            _ => debug!(
                "session {}: ignoring {control:?} as {:?} in {:?}",
                self.name,
                self.role,
                self.state()
            ),
        }
    }

    // ── Write pump ────────────────────────────────────────────────────────────

    async fn write_loop<W>(self: Arc<Self>, mut writer: W, mut rx: mpsc::Receiver<Bytes>)
    where
        W: AsyncWrite + Unpin,
    {
        let mut shutdown = self.shutdown.subscribe();

        loop {
            let bytes = tokio::select! {
                biased;
                next = rx.recv() => match next {
                    Some(bytes) => bytes,
                    None => break,
                },
                _ = signalled(&mut shutdown) => break,
            };

            let written = tokio::select! {
                res = writer.write_all(&bytes) => res,
                _ = signalled(&mut shutdown) => break,
            };
            if let Err(e) = written {
                debug!("session {}: write error: {e}", self.name);
                break;
            }
            self.last_write.store(self.now_ms(), Ordering::Relaxed);
        }

        if let Err(e) = writer.shutdown().await {
            debug!("session {}: shutdown error: {e}", self.name);
        }
        self.stop().await;
    }

    // ── Timers ────────────────────────────────────────────────────────────────

    async fn watchdog_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let idle = self.settings.idle_timeout;

        loop {
            let deadline = self.at(&self.last_read) + idle;
            tokio::select! {
                _ = signalled(&mut shutdown) => return,
                _ = sleep_until(deadline) => {}
            }
            if self.at(&self.last_read) + idle <= Instant::now() {
                info!("session {}: closing idle connection", self.name);
                self.close();
                return;
            }
        }
    }

    async fn keepalive_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let period = self.settings.ping_interval;
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = signalled(&mut shutdown) => return,
                _ = ticker.tick() => {}
            }
            if self.at(&self.last_write) + period <= Instant::now() {
                debug!("session {}: ping", self.name);
                self.send_msg(&control::ping(&self.local_uid));
            }
        }
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Tears the session down.  Only the first call does anything:
    ///
    /// 1. closes the outbound queue;
    /// 2. signals every task to let go of the transport;
    /// 3. deregisters from the hub;
    /// 4. releases each contact uid and announces it offline to the others;
    /// 5. tells the message handler.
    pub async fn stop(&self) {
        let prev = self.state.swap(SessionState::Closed as u8, Ordering::AcqRel);
        if prev == SessionState::Closed as u8 {
            return;
        }
        info!("session {}: stopping", self.name);

        self.queue().take();
        self.shutdown.send_replace(true);
        self.hub.deregister(&self.name);

        for (uid, _) in self.contacts() {
            if self.hub.release_uid(&uid, &self.name) {
                let offline = control::offline(&uid, "");
                self.hub.send_to_all_except(&offline, &self.name);
            }
        }

        self.handler.on_remove(&self.name).await;
    }
}

fn push(tx: Option<&mpsc::Sender<Bytes>>, bytes: Bytes) -> Result<(), SessionError> {
    let tx = tx.ok_or(SessionError::Closed)?;
    tx.try_send(bytes).map_err(|e| match e {
        mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
        mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
    })
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|closed| *closed).await;
}

impl Peer for Session {
    fn name(&self) -> &str {
        &self.name
    }

    fn deliver(&self, out: &Outbound<'_>) -> bool {
        if !self.is_active() {
            return false;
        }

        let msg = out.message();
        let stripped = if msg.is_local() || self.policy.can_see(&self.access, &msg.scope) {
            false
        } else if self.settings.interscope_chat && (msg.is_chat() || msg.is_chat_receipt()) {
            true
        } else {
            return false;
        };

        let queue = self.queue();
        let version = self.version();
        let bytes = if stripped {
            out.encoded_without_coords(version)
        } else {
            out.encoded(version)
        };
        let Some(bytes) = bytes else {
            return false;
        };

        match push(queue.as_ref(), bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!("session {}: dropping {}: {e}", self.name, msg.uid());
                false
            }
        }
    }

    fn has_callsign(&self, callsign: &str) -> bool {
        self.contacts.iter().any(|entry| entry.value() == callsign)
    }

    fn close(&self) {
        self.shutdown.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::relay::MockMessageHandler;
    use crate::application::scope::{DefaultScopePolicy, MockScopePolicy};
    use cot_core::domain::{CotEvent, Node};
    use tokio::io::{duplex, AsyncReadExt, DuplexStream};
    use tokio::time::timeout;

    fn context(handler: MockMessageHandler, policy: Arc<dyn ScopePolicy>) -> SessionContext {
        SessionContext {
            hub: Arc::new(RoutingHub::new(Codec::default())),
            handler: Arc::new(handler),
            policy,
            settings: SessionSettings::default(),
            local_uid: "relay-test".to_string(),
        }
    }

    fn quiet_handler() -> MockMessageHandler {
        let mut handler = MockMessageHandler::new();
        handler.expect_on_message().return_const(());
        handler.expect_on_new_contact().return_const(());
        handler.expect_on_remove().return_const(());
        handler
    }

    async fn read_some(client: &mut DuplexStream) -> String {
        let mut buf = vec![0u8; 4096];
        let n = timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .expect("read timed out")
            .expect("read failed");
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    fn chat(scope: &str) -> CotMessage {
        let mut msg = CotMessage::new(
            CotEvent::basic("b-t-f", "GeoChat.1", chrono::Duration::minutes(1)),
            Node::detail(),
        );
        msg.event.lat = 12.0;
        msg.scope = scope.to_string();
        msg
    }

    #[tokio::test]
    async fn test_server_role_advertises_version() {
        let ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));
        let (mut client, server) = duplex(8192);
        let session = Session::start(server, "tcp:test", Role::Server, Access::default(), &ctx);

        let text = read_some(&mut client).await;
        assert!(text.contains("t-x-takp-v"));
        assert!(text.contains("<TakProtocolSupport version=\"1\"/>"));
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(ctx.hub.session_names(), ["tcp:test"]);
    }

    #[tokio::test]
    async fn test_client_role_waits_silently() {
        let ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));
        let (mut client, server) = duplex(8192);
        let _session = Session::start(server, "up:test", Role::Client, Access::default(), &ctx);

        let mut buf = [0u8; 64];
        let read = timeout(Duration::from_millis(100), client.read(&mut buf)).await;
        assert!(read.is_err(), "client role must not speak first");
    }

    #[tokio::test]
    async fn test_policy_gates_delivery() {
        let mut policy = MockScopePolicy::new();
        policy
            .expect_can_see()
            .returning(|_, scope| scope != "red");

        let ctx = context(quiet_handler(), Arc::new(policy));
        let (_client, server) = duplex(8192);
        let session = Session::start(server, "tcp:test", Role::Server, Access::new("u", "blue"), &ctx);

        let mut red = chat("red");
        red.event.event_type = "a-f-G".to_string();
        assert!(!session.send_msg(&red));
        assert!(session.send_msg(&chat("blue")));
    }

    #[tokio::test]
    async fn test_interscope_chat_is_stripped() {
        let mut ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));
        ctx.settings.interscope_chat = true;
        let (mut client, server) = duplex(8192);
        let session = Session::start(server, "tcp:test", Role::Server, Access::new("u", "blue"), &ctx);
        let _ = read_some(&mut client).await;

        assert!(session.send_msg(&chat("red")));
        let text = read_some(&mut client).await;
        assert!(text.contains("type=\"b-t-f\""));
        assert!(text.contains("lat=\"0\""));
    }

    #[tokio::test]
    async fn test_full_queue_drops() {
        let mut ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));
        ctx.settings.queue_capacity = 1;
        // A one-byte pipe stalls the write pump on the first message.
        let (_client, server) = duplex(1);
        let session = Session::start(server, "tcp:test", Role::Client, Access::default(), &ctx);

        let results: Vec<bool> = (0..5).map(|_| session.send_msg(&chat(""))).collect();
        assert!(results.iter().any(|sent| !sent), "some sends must be dropped");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_notifies_once() {
        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_remove()
            .withf(|name| name == "tcp:test")
            .times(1)
            .return_const(());
        let ctx = context(handler, Arc::new(DefaultScopePolicy));
        let (_client, server) = duplex(8192);
        let session = Session::start(server, "tcp:test", Role::Server, Access::default(), &ctx);

        session.stop().await;
        session.stop().await;
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.send_msg(&chat("")));
        assert!(ctx.hub.is_empty());
    }

    #[tokio::test]
    async fn test_contacts_lookup() {
        let ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));
        let (_client, server) = duplex(8192);
        let session = Session::start(server, "tcp:test", Role::Server, Access::default(), &ctx);
        session.contacts.insert("u1".to_string(), "Alpha".to_string());

        assert_eq!(session.uid_for_callsign("Alpha").as_deref(), Some("u1"));
        assert!(session.has_callsign("Alpha"));
        assert!(session.has_uid("u1"));
        assert_eq!(session.contacts(), [("u1".to_string(), "Alpha".to_string())]);
        assert_eq!(session.uid_for_callsign("Bravo"), None);
    }

    #[tokio::test]
    async fn test_scripted_stream_hands_events_to_handler_then_stops_on_eof() {
        // A client-role session stays silent, so the script only has reads;
        // any write would fail the mock.
        let event = Codec::default().encode_xml(&chat("")).unwrap();
        let (first, rest) = event.split_at(10);
        let stream = tokio_test::io::Builder::new()
            .read(b"<?xml version=\"1.0\"?>")
            .read(first)
            .read(rest)
            .build();

        let mut handler = MockMessageHandler::new();
        handler
            .expect_on_message()
            .withf(|msg| msg.uid() == "GeoChat.1" && msg.from == "up:scripted")
            .times(1)
            .return_const(());
        handler.expect_on_remove().return_const(());
        let ctx = context(handler, Arc::new(DefaultScopePolicy));

        let session = Session::start(stream, "up:scripted", Role::Client, Access::default(), &ctx);
        timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("EOF must stop the session");
    }

    #[tokio::test]
    async fn test_failed_write_shuts_transport_down_and_stops() {
        // The advertisement is the first write and the transport rejects it.
        let stream = tokio_test::io::Builder::new()
            .write_error(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
            .build();
        let ctx = context(quiet_handler(), Arc::new(DefaultScopePolicy));

        let session = Session::start(stream, "tcp:broken", Role::Server, Access::default(), &ctx);
        timeout(Duration::from_secs(2), session.closed())
            .await
            .expect("a failed write must stop the session");

        assert_eq!(session.state(), SessionState::Closed);
        assert!(ctx.hub.is_empty());
    }
}
