//! In-memory relay double for end-to-end tests.
//!
//! Speaks the real wire protocol over channel-backed transports: answers
//! the handshake with genuine P-256 + Ed25519 material, assigns stream
//! sequences, acknowledges events, pages replay, and can be told to
//! misbehave (duplicate server_hello, silence, forced closes).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use pb_crypto::{ecdh::EphemeralKeyPair, hash, identity::IdentityKeyPair};
use pb_proto::{frame, Event, Frame, Inbound};
use pb_sync::{Connector, SyncError, Transport, TransportEvent};

pub enum ServerMsg {
    Text(String),
    Close(Option<u16>),
}

#[derive(Default)]
pub struct RelayState {
    pub events: Vec<Event>,
    pub received_order: Vec<(String, u64)>,
    pub last_ack: HashMap<String, u64>,
    stream_seq: HashMap<String, u64>,
    sessions: Vec<SessionHandle>,
    pub connections: u32,
    pub established: u32,
    pub client_auth_count: u32,
    // Misbehaviour knobs
    pub duplicate_server_hello: bool,
    pub silent: bool,
    /// Deliver other-device history as live events after establishment.
    pub push_history: bool,
}

struct SessionHandle {
    device_id: Option<String>,
    tx: mpsc::UnboundedSender<ServerMsg>,
}

pub struct TestRelay {
    pub server_identity: IdentityKeyPair,
    pub state: Arc<Mutex<RelayState>>,
}

impl TestRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            server_identity: IdentityKeyPair::generate(),
            state: Arc::new(Mutex::new(RelayState { push_history: true, ..Default::default() })),
        })
    }

    pub fn connector(self: &Arc<Self>) -> Arc<dyn Connector> {
        Arc::new(TestConnector { relay: self.clone() })
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut RelayState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }

    /// Seed a pre-existing event (as if another device uploaded it
    /// earlier) with the next stream sequence for its stream.
    pub fn seed_event(&self, mut event: Event) {
        let mut state = self.state.lock().unwrap();
        let seq = state.stream_seq.entry(event.stream_id.clone()).or_insert(0);
        *seq += 1;
        event.stream_seq = *seq;
        event.created_at = Some(pb_store::now_ms());
        let entry = state.last_ack.entry(event.device_id.clone()).or_insert(0);
        *entry = (*entry).max(event.device_seq);
        state.events.push(event);
    }

    pub fn set_last_ack(&self, device_id: &str, seq: u64) {
        self.state.lock().unwrap().last_ack.insert(device_id.to_string(), seq);
    }

    /// Push a server-originated frame to every live session.
    pub fn broadcast(&self, frame: &Frame) {
        let state = self.state.lock().unwrap();
        for session in &state.sessions {
            let _ = session.tx.send(ServerMsg::Text(frame.encode().unwrap()));
        }
    }

    /// Close every live session with the given code.
    pub fn force_close(&self, code: u16) {
        let mut state = self.state.lock().unwrap();
        for session in state.sessions.drain(..) {
            let _ = session.tx.send(ServerMsg::Close(Some(code)));
        }
    }
}

struct TestConnector {
    relay: Arc<TestRelay>,
}

#[async_trait]
impl Connector for TestConnector {
    async fn connect(&self, _url: &str) -> Result<Box<dyn Transport>, SyncError> {
        let (c2s_tx, c2s_rx) = mpsc::unbounded_channel::<String>();
        let (s2c_tx, s2c_rx) = mpsc::unbounded_channel::<ServerMsg>();

        {
            let mut state = self.relay.state.lock().unwrap();
            state.connections += 1;
            state.sessions.push(SessionHandle { device_id: None, tx: s2c_tx.clone() });
        }
        tokio::spawn(serve(self.relay.clone(), c2s_rx, s2c_tx));

        Ok(Box::new(ChanTransport { tx: c2s_tx, rx: s2c_rx, closed: false }))
    }
}

struct ChanTransport {
    tx: mpsc::UnboundedSender<String>,
    rx: mpsc::UnboundedReceiver<ServerMsg>,
    closed: bool,
}

#[async_trait]
impl Transport for ChanTransport {
    async fn send(&mut self, text: String) -> Result<(), SyncError> {
        self.tx
            .send(text)
            .map_err(|_| SyncError::Transport("relay gone".into()))
    }

    async fn recv(&mut self) -> TransportEvent {
        if self.closed {
            return TransportEvent::Closed { code: None };
        }
        match self.rx.recv().await {
            Some(ServerMsg::Text(text)) => TransportEvent::Frame(text),
            Some(ServerMsg::Close(code)) => {
                self.closed = true;
                TransportEvent::Closed { code }
            }
            None => {
                self.closed = true;
                TransportEvent::Closed { code: None }
            }
        }
    }

    async fn ping(&mut self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.rx.close();
    }
}

async fn serve(
    relay: Arc<TestRelay>,
    mut rx: mpsc::UnboundedReceiver<String>,
    tx: mpsc::UnboundedSender<ServerMsg>,
) {
    let mut nonce_c: Option<String> = None;
    let mut server_eph: Option<EphemeralKeyPair> = None;
    let mut device_id: Option<String> = None;

    let send = |frame: &Frame, tx: &mpsc::UnboundedSender<ServerMsg>| {
        let _ = tx.send(ServerMsg::Text(frame.encode().unwrap()));
    };

    while let Some(text) = rx.recv().await {
        let frame = match frame::decode(&text) {
            Ok(Inbound::Frame(frame)) => frame,
            _ => continue,
        };
        match frame {
            Frame::ClientHello { client_ephemeral_pub: _, nonce } => {
                if relay.with_state(|s| s.silent) {
                    continue;
                }
                let eph = EphemeralKeyPair::generate();
                let nonce_s = hash::handshake_nonce();
                let digest = hash::server_signature_digest(
                    relay.server_identity.public_hex(),
                    eph.public_hex(),
                    &nonce,
                    &nonce_s,
                );
                let hello = Frame::ServerHello {
                    server_ephemeral_pub: eph.public_hex().to_string(),
                    server_identity_pub: relay.server_identity.public_hex().to_string(),
                    server_signature: relay.server_identity.sign_hex(&digest),
                    nonce: nonce_s,
                };
                send(&hello, &tx);
                if relay.with_state(|s| s.duplicate_server_hello) {
                    send(&hello, &tx);
                }
                nonce_c = Some(nonce);
                server_eph = Some(eph);
            }
            Frame::ClientAuth { user_id: _, device_id: auth_device, .. } => {
                relay.with_state(|s| s.client_auth_count += 1);
                if nonce_c.is_none() || server_eph.is_none() {
                    continue;
                }
                let last_ack = relay.with_state(|s| {
                    s.established += 1;
                    for session in &mut s.sessions {
                        if session.tx.same_channel(&tx) {
                            session.device_id = Some(auth_device.clone());
                        }
                    }
                    s.last_ack.get(&auth_device).copied().unwrap_or(0)
                });
                send(
                    &Frame::SessionEstablished {
                        device_id: auth_device.clone(),
                        last_ack_device_seq: last_ack,
                        expires_at: pb_store::now_ms() + 3_600_000,
                    },
                    &tx,
                );
                if relay.with_state(|s| s.push_history) {
                    let history: Vec<Event> = relay.with_state(|s| {
                        s.events
                            .iter()
                            .filter(|e| e.device_id != auth_device)
                            .cloned()
                            .collect()
                    });
                    for event in history {
                        send(&Frame::Event(event), &tx);
                    }
                }
                device_id = Some(auth_device);
            }
            Frame::Event(mut event) => {
                let ack = relay.with_state(|s| {
                    let seq = s.stream_seq.entry(event.stream_id.clone()).or_insert(0);
                    *seq += 1;
                    event.stream_seq = *seq;
                    event.created_at = Some(pb_store::now_ms());
                    s.received_order.push((event.device_id.clone(), event.device_seq));
                    let entry = s.last_ack.entry(event.device_id.clone()).or_insert(0);
                    *entry = (*entry).max(event.device_seq);
                    s.events.push(event.clone());

                    // Fan out to the user's other live sessions.
                    for session in &s.sessions {
                        let foreign = session
                            .device_id
                            .as_deref()
                            .map(|d| d != event.device_id)
                            .unwrap_or(false);
                        if foreign {
                            let _ = session
                                .tx
                                .send(ServerMsg::Text(Frame::Event(event.clone()).encode().unwrap()));
                        }
                    }
                    Frame::Ack {
                        device_seq: event.device_seq,
                        device_id: Some(event.device_id.clone()),
                    }
                });
                send(&ack, &tx);
            }
            Frame::ReplayRequest { last_ack_device_seq: _, limit, continuation_token } => {
                let requester = device_id.clone().unwrap_or_default();
                let offset: usize = continuation_token
                    .and_then(|t| t.parse().ok())
                    .unwrap_or(0);
                let (page, has_more, next, total) = relay.with_state(|s| {
                    let all: Vec<Event> = s
                        .events
                        .iter()
                        .filter(|e| e.device_id != requester)
                        .cloned()
                        .collect();
                    let total = all.len() as u64;
                    let end = (offset + limit as usize).min(all.len());
                    let page = all[offset.min(all.len())..end].to_vec();
                    let has_more = end < all.len();
                    (page, has_more, end.to_string(), total)
                });
                send(
                    &Frame::ReplayResponse {
                        events: page,
                        has_more,
                        continuation_token: has_more.then_some(next),
                        total_events: Some(total),
                    },
                    &tx,
                );
            }
            _ => {}
        }
    }

    // Connection gone — drop the session handle.
    relay.with_state(|s| {
        s.sessions.retain(|session| !session.tx.same_channel(&tx));
    });
}

/// Poll until `probe` yields Some, or panic after `timeout`.
pub async fn wait_for<T>(
    timeout: Duration,
    mut probe: impl FnMut() -> Option<T>,
) -> T {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
