//! Connection Manager — the core task.
//!
//! Owns exactly one transport at a time, drives the handshake, routes
//! inbound frames, buffers outbound traffic while there is no open
//! transport, and reconnects with capped exponential backoff. Everything
//! that mutates connection, session, sequence, or log state runs here;
//! the rest of the crate talks to this task over the command channel.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use pb_crypto::identity::IdentityKeyPair;
use pb_crypto::kdf::SymmetricKey;
use pb_proto::{frame, Event, EventPayload, Frame, Inbound};
use pb_store::{QueueBounds, SequenceAllocator};

use crate::{
    builder,
    context::Shared,
    error::SyncError,
    handshake::{HandshakeEngine, HandshakeOutcome},
    subscribers::ConnectionStatus,
    transport::{Connector, Transport, TransportEvent, CLOSE_SESSION_ROTATION},
};

const OUTBOUND_BUFFER_CAP: usize = 256;
/// Clean rotation happens this far ahead of the announced session expiry.
const ROTATE_LEAD_MS: i64 = 30_000;
const ROTATION_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MIN_RECONNECT_DELAY_MS: u64 = 1_000;

/// `min(max, base · 2^attempt)`, floored at one second.
pub(crate) fn backoff_delay_ms(base_ms: u64, max_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.min(16);
    base_ms
        .saturating_mul(1u64 << exp)
        .min(max_ms)
        .max(MIN_RECONNECT_DELAY_MS)
}

pub(crate) enum Command {
    Connect,
    Disconnect,
    Publish {
        stream_id: String,
        payload: EventPayload,
        ttl: Option<i64>,
        reply: oneshot::Sender<Result<Event, SyncError>>,
    },
    /// Background-sync contract: connect if disconnected, then drain.
    SyncRequested,
    /// Pairing adopted a new identity (or a reset cleared it).
    IdentityChanged,
    Shutdown,
}

pub(crate) struct SessionState {
    /// Derived during the handshake; cleared on rotation. The current
    /// profile encrypts event payloads under the shared key, so this key's
    /// job ends at mutual authentication — stronger profiles wrap traffic
    /// with it.
    #[allow(dead_code)]
    pub key: SymmetricKey,
    pub expires_at: i64,
}

pub(crate) struct ReplayState {
    pub continuation_token: Option<String>,
}

#[derive(Default)]
struct Timers {
    reconnect_at: Option<Instant>,
    rotate_at: Option<Instant>,
    handshake_deadline: Option<Instant>,
    replay_next_at: Option<Instant>,
    replay_deadline: Option<Instant>,
    keepalive_at: Option<Instant>,
}

impl Timers {
    fn next_deadline(&self) -> Option<Instant> {
        [
            self.reconnect_at,
            self.rotate_at,
            self.handshake_deadline,
            self.replay_next_at,
            self.replay_deadline,
            self.keepalive_at,
        ]
        .into_iter()
        .flatten()
        .min()
    }
}

enum Wake {
    Command(Option<Command>),
    Net(TransportEvent),
    Timer,
}

pub(crate) struct Core {
    pub(crate) shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    pub(crate) identity: Option<IdentityKeyPair>,
    pub(crate) allocator: SequenceAllocator,
    pub(crate) last_ack: u64,
    status: ConnectionStatus,
    want_connected: bool,
    transport: Option<Box<dyn Transport>>,
    pub(crate) handshake: Option<HandshakeEngine>,
    pub(crate) session: Option<SessionState>,
    outbound_buffer: VecDeque<String>,
    reconnect_attempt: u32,
    timers: Timers,
    pub(crate) replay: Option<ReplayState>,
    stopping: bool,
}

impl Core {
    pub(crate) async fn start(
        shared: Arc<Shared>,
        connector: Arc<dyn Connector>,
        rx: mpsc::Receiver<Command>,
    ) -> Result<tokio::task::JoinHandle<()>, SyncError> {
        let identity = shared.settings.load_identity().await?;
        let allocator = SequenceAllocator::load(shared.store.clone()).await?;
        let last_ack = shared.settings.last_ack_device_seq().await?;
        if identity.is_some() {
            // Prime the shared-key cache so synchronous observers can
            // decrypt from the first inbound event.
            let _ = shared.shared_key().await;
        }

        let core = Self {
            shared,
            connector,
            identity,
            allocator,
            last_ack,
            status: ConnectionStatus::Disconnected,
            want_connected: false,
            transport: None,
            handshake: None,
            session: None,
            outbound_buffer: VecDeque::new(),
            reconnect_attempt: 0,
            timers: Timers::default(),
            replay: None,
            stopping: false,
        };
        Ok(tokio::spawn(core.run(rx)))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<Command>) {
        self.shared.subscribers.notify_status(ConnectionStatus::Disconnected);
        while !self.stopping {
            let deadline = self.timers.next_deadline();
            let wake = tokio::select! {
                command = rx.recv() => Wake::Command(command),
                event = Self::recv_transport(&mut self.transport) => Wake::Net(event),
                _ = Self::sleep_opt(deadline) => Wake::Timer,
            };
            match wake {
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Command(None) => break,
                Wake::Net(event) => self.handle_transport(event).await,
                Wake::Timer => self.handle_timers().await,
            }
        }
        self.teardown_transport().await;
        debug!("core task stopped");
    }

    async fn recv_transport(transport: &mut Option<Box<dyn Transport>>) -> TransportEvent {
        match transport {
            Some(t) => t.recv().await,
            None => std::future::pending().await,
        }
    }

    async fn sleep_opt(deadline: Option<Instant>) {
        match deadline {
            Some(d) => tokio::time::sleep_until(d).await,
            None => std::future::pending().await,
        }
    }

    // ── Commands ─────────────────────────────────────────────────────────

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => {
                self.want_connected = true;
                self.reconnect_attempt = 0;
                self.timers.reconnect_at = None;
                if self.transport.is_none() {
                    self.open_now().await;
                }
            }
            Command::Disconnect => {
                self.want_connected = false;
                self.reconnect_attempt = 0;
                self.timers = Timers::default();
                self.teardown_transport().await;
                self.set_status(ConnectionStatus::Disconnected);
            }
            Command::Publish { stream_id, payload, ttl, reply } => {
                let result = self.publish(stream_id, payload, ttl).await;
                if let Err(e) = &result {
                    self.shared.subscribers.notify_error(e);
                }
                let _ = reply.send(result);
            }
            Command::SyncRequested => {
                self.want_connected = true;
                if self.transport.is_none() {
                    self.timers.reconnect_at = None;
                    self.open_now().await;
                } else if self.session.is_some() {
                    self.drain_pending().await;
                }
            }
            Command::IdentityChanged => self.on_identity_changed().await,
            Command::Shutdown => {
                self.stopping = true;
            }
        }
    }

    async fn publish(
        &mut self,
        stream_id: String,
        payload: EventPayload,
        ttl: Option<i64>,
    ) -> Result<Event, SyncError> {
        let user_id = self
            .identity
            .as_ref()
            .map(|i| i.public_hex().to_string())
            .ok_or(SyncError::NotInitialized)?;
        let shared_key = self.shared.shared_key().await?;
        let device = self.shared.device();

        let event = builder::build_event(
            &shared_key,
            &user_id,
            &device.device_id,
            stream_id,
            &payload,
            ttl,
            &mut self.allocator,
        )
        .await?;

        // Emission invariant: device_seq must exceed the acknowledgement
        // mark. A violation means the counter was repaired underneath us;
        // drop the event and realign.
        if event.device_seq <= self.last_ack {
            self.allocator.reconcile(self.last_ack).await?;
            return Err(SyncError::Validation(
                "sequence counter behind acknowledgement mark — event dropped".into(),
            ));
        }

        self.shared.log.append(&event).await?;
        let bounds = QueueBounds {
            max_count: self.shared.config.queue_max_count,
            max_bytes: self.shared.config.queue_max_bytes,
        };
        self.shared
            .log
            .enforce_bounds(&user_id, &device.device_id, self.last_ack, bounds)
            .await?;

        if self.session.is_some() {
            // Durable already; a transport fault here just leaves the event
            // pending for the next drain.
            if let Err(e) = self.send_frame(&Frame::Event(event.clone())).await {
                warn!(error = %e, "transmit failed — event stays pending");
            }
        }
        Ok(event)
    }

    async fn on_identity_changed(&mut self) {
        match self.shared.settings.load_identity().await {
            Ok(identity) => {
                self.shared
                    .set_identity_pub(identity.as_ref().map(|i| i.public_hex().to_string()));
                self.identity = identity;
            }
            Err(e) => {
                warn!(error = %e, "identity reload failed");
                return;
            }
        }
        if self.identity.is_some() {
            let _ = self.shared.shared_key().await;
        }
        self.last_ack = self.shared.settings.last_ack_device_seq().await.unwrap_or(0);

        if self.want_connected || self.transport.is_some() {
            info!("identity changed — rotating connection");
            self.want_connected = true;
            self.teardown_transport().await;
            self.set_status(ConnectionStatus::Rotating);
            self.timers.reconnect_at = Some(Instant::now() + ROTATION_RECONNECT_DELAY);
        }
    }

    // ── Transport lifecycle ──────────────────────────────────────────────

    async fn resolve_ws_url(&self) -> Result<String, SyncError> {
        if let Some(url) = &self.shared.config.ws_url {
            return Ok(url.clone());
        }
        self.shared
            .settings
            .ws_url()
            .await?
            .ok_or_else(|| SyncError::Validation("no ws_url configured or paired".into()))
    }

    async fn open_now(&mut self) {
        if self.transport.is_some() {
            return;
        }
        if self.identity.is_none() {
            self.shared.subscribers.notify_error(&SyncError::NotInitialized);
            self.set_status(ConnectionStatus::Error);
            return;
        }
        let url = match self.resolve_ws_url().await {
            Ok(url) => url,
            Err(e) => {
                self.shared.subscribers.notify_error(&e);
                self.set_status(ConnectionStatus::Error);
                return;
            }
        };

        self.set_status(ConnectionStatus::Connecting);
        match self.connector.connect(&url).await {
            Ok(mut transport) => {
                // Flush frames buffered while there was no transport,
                // in submission order.
                while let Some(text) = self.outbound_buffer.pop_front() {
                    if let Err(e) = transport.send(text).await {
                        warn!(error = %e, "buffered frame flush failed");
                        break;
                    }
                }
                self.transport = Some(transport);
                self.begin_handshake().await;
            }
            Err(e) => {
                warn!(error = %e, url, "transport open failed");
                self.shared.subscribers.notify_error(&e);
                self.set_status(ConnectionStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    async fn begin_handshake(&mut self) {
        self.set_status(ConnectionStatus::Authenticating);
        let mut engine =
            HandshakeEngine::new(self.shared.config.pinned_server_key_hex.clone());
        let hello = engine.client_hello();
        self.handshake = Some(engine);
        self.timers.handshake_deadline = Some(
            Instant::now() + Duration::from_millis(self.shared.config.handshake_timeout_ms),
        );
        self.timers.keepalive_at = Some(
            Instant::now() + Duration::from_millis(self.shared.config.keepalive_interval_ms),
        );
        if let Err(e) = self.send_frame(&hello).await {
            self.fail_handshake(e).await;
        }
    }

    pub(crate) async fn fail_handshake(&mut self, error: SyncError) {
        warn!(error = %error, "handshake failed — closing transport");
        self.shared.subscribers.notify_error(&error);
        self.teardown_transport().await;
        self.set_status(ConnectionStatus::Error);
        self.schedule_reconnect();
    }

    async fn teardown_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close().await;
        }
        self.handshake = None;
        self.session = None;
        self.replay = None;
        self.timers.handshake_deadline = None;
        self.timers.replay_next_at = None;
        self.timers.replay_deadline = None;
        self.timers.keepalive_at = None;
        self.timers.rotate_at = None;
    }

    fn schedule_reconnect(&mut self) {
        // The prior transport is torn down before any scheduling.
        debug_assert!(self.transport.is_none());
        let delay = backoff_delay_ms(
            self.shared.config.reconnect_base_ms,
            self.shared.config.reconnect_max_ms,
            self.reconnect_attempt,
        );
        self.reconnect_attempt += 1;
        info!(attempt = self.reconnect_attempt, delay_ms = delay, "reconnect scheduled");
        self.timers.reconnect_at = Some(Instant::now() + Duration::from_millis(delay));
    }

    // ── Inbound ──────────────────────────────────────────────────────────

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(text) => self.handle_frame_text(&text).await,
            TransportEvent::Closed { code } => self.on_closed(code).await,
        }
    }

    async fn handle_frame_text(&mut self, text: &str) {
        match frame::decode(text) {
            Ok(Inbound::Frame(frame)) => {
                debug!(frame = frame.type_tag(), "inbound frame");
                self.dispatch_frame(frame).await;
            }
            Ok(Inbound::Unknown(tag)) => {
                debug!(tag, "unknown frame type dropped");
            }
            Err(e) => {
                if self.status == ConnectionStatus::Authenticating {
                    self.fail_handshake(SyncError::HandshakeRejected(format!(
                        "malformed frame: {e}"
                    )))
                    .await;
                } else {
                    warn!(error = %e, "malformed frame dropped");
                }
            }
        }
    }

    async fn dispatch_frame(&mut self, frame: Frame) {
        match frame {
            Frame::ServerHello { .. } | Frame::SessionEstablished { .. } => {
                self.drive_handshake(frame).await
            }
            Frame::Event(event) => self.ingest_remote(event).await,
            Frame::Ack { device_seq, device_id } => self.on_ack(device_seq, device_id).await,
            Frame::ReplayResponse { events, has_more, continuation_token, total_events } => {
                self.on_replay_response(events, has_more, continuation_token, total_events)
                    .await
            }
            Frame::SessionExpiringSoon { expires_at, expires_in_seconds } => {
                self.on_expiring_soon(expires_at, expires_in_seconds);
            }
            Frame::FullResyncRequired { reason, recommendation } => {
                self.on_full_resync(reason, recommendation).await;
            }
            Frame::Error { message, code } => {
                warn!(?code, message, "relay error frame");
                self.shared.subscribers.notify_error(&SyncError::Transport(message));
            }
            other => {
                debug!(frame = other.type_tag(), "unexpected inbound frame dropped");
            }
        }
    }

    async fn drive_handshake(&mut self, frame: Frame) {
        let Some(mut engine) = self.handshake.take() else {
            debug!(frame = frame.type_tag(), "handshake frame outside a handshake — dropped");
            return;
        };
        let device_id = self.shared.device().device_id;
        let Some(identity) = self.identity.as_ref() else {
            self.fail_handshake(SyncError::NotInitialized).await;
            return;
        };
        let outcome = engine.handle(&frame, identity, &device_id);
        self.handshake = Some(engine);
        match outcome {
            Ok(HandshakeOutcome::Send(response)) => {
                if let Err(e) = self.send_frame(&response).await {
                    self.fail_handshake(e).await;
                }
            }
            Ok(HandshakeOutcome::Established(info)) => self.on_established(*info).await,
            Ok(HandshakeOutcome::Ignored) => {}
            Err(e) => self.fail_handshake(e).await,
        }
    }

    fn on_expiring_soon(&mut self, expires_at: i64, expires_in_seconds: u64) {
        info!(expires_in_seconds, "pre-expiry rotation scheduled");
        self.schedule_rotation_before(expires_at);
    }

    /// Schedule a clean rotation `ROTATE_LEAD_MS` ahead of the announced
    /// expiry (immediately when already inside the lead window).
    pub(crate) fn schedule_rotation_before(&mut self, expires_at: i64) {
        if expires_at <= 0 {
            return;
        }
        let lead = expires_at - pb_store::now_ms() - ROTATE_LEAD_MS;
        self.timers.rotate_at = Some(Instant::now() + Duration::from_millis(lead.max(0) as u64));
    }

    // Timer accessors for the sync half of the state machine.

    pub(crate) fn clear_handshake_deadline(&mut self) {
        self.timers.handshake_deadline = None;
    }

    pub(crate) fn reset_reconnect_attempts(&mut self) {
        self.reconnect_attempt = 0;
    }

    pub(crate) fn set_replay_deadline(&mut self, at: Option<Instant>) {
        self.timers.replay_deadline = at;
    }

    pub(crate) fn set_replay_next(&mut self, at: Option<Instant>) {
        self.timers.replay_next_at = at;
    }

    async fn on_full_resync(&mut self, reason: String, recommendation: Option<String>) {
        warn!(reason, ?recommendation, "server requested full resync — wiping local log");
        self.shared
            .subscribers
            .notify_error(&SyncError::FullResyncRequired(reason));
        if let Err(e) = self.shared.log.clear().await {
            warn!(error = %e, "event log wipe failed");
        }
        self.last_ack = 0;
        if let Err(e) = self.shared.settings.set_last_ack_device_seq(0).await {
            warn!(error = %e, "ack reset failed");
        }
        self.teardown_transport().await;
        self.set_status(ConnectionStatus::Rotating);
        self.open_now().await;
    }

    async fn on_closed(&mut self, code: Option<u16>) {
        let was_authenticating = self.status == ConnectionStatus::Authenticating;
        self.teardown_transport().await;
        if !self.want_connected {
            self.set_status(ConnectionStatus::Disconnected);
            return;
        }
        match code {
            Some(CLOSE_SESSION_ROTATION) => {
                // Session-key rotation demanded: fast reconnect, no backoff,
                // no user-visible error.
                info!("close 1001 — session rotation");
                self.set_status(ConnectionStatus::Rotating);
                self.timers.reconnect_at = Some(Instant::now() + ROTATION_RECONNECT_DELAY);
            }
            code => {
                debug!(?code, was_authenticating, "transport closed — reconnecting");
                self.set_status(ConnectionStatus::Error);
                self.schedule_reconnect();
            }
        }
    }

    // ── Timers ───────────────────────────────────────────────────────────

    async fn handle_timers(&mut self) {
        let now = Instant::now();

        if take_due(&mut self.timers.reconnect_at, now) {
            if self.want_connected && self.transport.is_none() {
                self.open_now().await;
            }
        }
        if take_due(&mut self.timers.handshake_deadline, now) {
            if self.session.is_none() && self.transport.is_some() {
                self.fail_handshake(SyncError::HandshakeRejected("handshake timed out".into()))
                    .await;
            }
        }
        if take_due(&mut self.timers.rotate_at, now) {
            if self.session.is_some() {
                info!("session expiring — clean rotation");
                self.teardown_transport().await;
                self.set_status(ConnectionStatus::Rotating);
                self.open_now().await;
            }
        }
        if take_due(&mut self.timers.replay_next_at, now) {
            self.send_next_replay_request().await;
        }
        if take_due(&mut self.timers.replay_deadline, now) {
            warn!("replay page timed out — abandoning replay, draining pending");
            self.replay = None;
            self.drain_pending().await;
        }
        if take_due(&mut self.timers.keepalive_at, now) {
            if let Some(transport) = &mut self.transport {
                if let Err(e) = transport.ping().await {
                    debug!(error = %e, "keepalive ping failed");
                }
                self.timers.keepalive_at = Some(
                    now + Duration::from_millis(self.shared.config.keepalive_interval_ms),
                );
            }
        }
    }

    // ── Outbound ─────────────────────────────────────────────────────────

    /// Outbound discipline:
    /// - no transport → serialized into the bounded buffer (the
    ///   serialization is the deep copy), flushed in order on next open;
    /// - transport open but session not established → handshake frames
    ///   pass, data frames are refused (their events are Pending and the
    ///   post-establishment drain owns them);
    /// - established → straight through.
    pub(crate) async fn send_frame(&mut self, frame: &Frame) -> Result<(), SyncError> {
        let text = frame.encode()?;
        match &mut self.transport {
            None => {
                if self.outbound_buffer.len() >= OUTBOUND_BUFFER_CAP {
                    self.outbound_buffer.pop_front();
                    warn!("outbound buffer full — oldest frame dropped");
                }
                self.outbound_buffer.push_back(text);
                Ok(())
            }
            Some(transport) => {
                if self.session.is_none() && !frame.is_handshake() {
                    debug!(frame = frame.type_tag(), "data frame before establishment refused");
                    return Ok(());
                }
                transport.send(text).await
            }
        }
    }

    pub(crate) fn set_status(&mut self, status: ConnectionStatus) {
        if self.status != status {
            info!(?status, "connection status");
            self.status = status;
            self.shared.subscribers.notify_status(status);
        }
    }
}

fn take_due(slot: &mut Option<Instant>, now: Instant) -> bool {
    match slot {
        Some(at) if *at <= now => {
            *slot = None;
            true
        }
        _ => false,
    }
}
