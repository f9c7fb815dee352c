//! Four-message session handshake.
//!
//! ```text
//! C → S : client_hello        { client_ephemeral_pub, nonce_c }
//! S → C : server_hello        { server_ephemeral_pub, server_identity_pub,
//!                               server_signature, nonce_s }
//! C → S : client_auth         { user_id, device_id, client_signature, nonce_c2 }
//! S → C : session_established { device_id, last_ack_device_seq, expires_at }
//! ```
//!
//! The engine is sans-IO: the Connection Manager feeds it frames and
//! transmits whatever it returns. It fails closed — any unexpected input
//! in a state that cannot accept it is either ignored (duplicates) or a
//! typed rejection that tears the transport down.
//!
//! Server-signature verification only runs when a pinned server key is
//! configured; the deployed profile is trust-on-first-use.

use pb_crypto::{
    ecdh::EphemeralKeyPair,
    hash,
    identity::{self, IdentityKeyPair},
    kdf::{self, SymmetricKey},
};
use pb_proto::Frame;
use tracing::{debug, info};

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingServerHello,
    AwaitingSessionEstablished,
    Established,
    Failed,
}

/// What the Connection Manager receives when the handshake completes.
#[derive(Debug)]
pub struct SessionInfo {
    pub session_key: SymmetricKey,
    pub last_ack_device_seq: u64,
    /// Unix ms; the manager schedules a clean rotation shortly before it.
    pub expires_at: i64,
}

#[derive(Debug)]
pub enum HandshakeOutcome {
    /// Transmit this frame.
    Send(Frame),
    /// Handshake complete; transient state has been destroyed.
    Established(Box<SessionInfo>),
    /// Duplicate or out-of-order input — drop silently.
    Ignored,
}

pub struct HandshakeEngine {
    state: HandshakeState,
    ephemeral: Option<EphemeralKeyPair>,
    nonce_c: String,
    nonce_s: Option<String>,
    server_ephemeral_pub: Option<String>,
    session_key: Option<SymmetricKey>,
    /// `client_auth` goes out exactly once per handshake; the latch is set
    /// before the auth frame is even constructed.
    client_auth_sent: bool,
    /// Reentrancy guard across the server_hello processing window.
    processing: bool,
    pinned_server_key_hex: Option<String>,
}

impl HandshakeEngine {
    pub fn new(pinned_server_key_hex: Option<String>) -> Self {
        Self {
            state: HandshakeState::Idle,
            ephemeral: None,
            nonce_c: String::new(),
            nonce_s: None,
            server_ephemeral_pub: None,
            session_key: None,
            client_auth_sent: false,
            processing: false,
            pinned_server_key_hex,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Start the handshake: fresh ephemeral keypair and nonce, emits
    /// `client_hello`.
    pub fn client_hello(&mut self) -> Frame {
        let ephemeral = EphemeralKeyPair::generate();
        let nonce_c = hash::handshake_nonce();
        let frame = Frame::ClientHello {
            client_ephemeral_pub: ephemeral.public_hex().to_string(),
            nonce: nonce_c.clone(),
        };
        self.ephemeral = Some(ephemeral);
        self.nonce_c = nonce_c;
        self.state = HandshakeState::AwaitingServerHello;
        frame
    }

    /// Feed one inbound frame. Non-handshake frames must not be routed
    /// here.
    pub fn handle(
        &mut self,
        frame: &Frame,
        identity: &IdentityKeyPair,
        device_id: &str,
    ) -> Result<HandshakeOutcome, SyncError> {
        match frame {
            Frame::ServerHello {
                server_ephemeral_pub,
                server_identity_pub,
                server_signature,
                nonce,
            } => self.on_server_hello(
                server_ephemeral_pub,
                server_identity_pub,
                server_signature,
                nonce,
                identity,
                device_id,
            ),
            Frame::SessionEstablished { last_ack_device_seq, expires_at, .. } => {
                self.on_session_established(*last_ack_device_seq, *expires_at)
            }
            other => {
                debug!(frame = other.type_tag(), "non-handshake frame routed to handshake engine");
                Ok(HandshakeOutcome::Ignored)
            }
        }
    }

    fn on_server_hello(
        &mut self,
        server_ephemeral_pub: &str,
        server_identity_pub: &str,
        server_signature: &str,
        nonce_s: &str,
        identity: &IdentityKeyPair,
        device_id: &str,
    ) -> Result<HandshakeOutcome, SyncError> {
        if self.state != HandshakeState::AwaitingServerHello || self.processing {
            debug!("duplicate server_hello ignored");
            return Ok(HandshakeOutcome::Ignored);
        }
        if self.client_auth_sent {
            return Ok(HandshakeOutcome::Ignored);
        }
        self.processing = true;
        // Latch first: no interleaving of this window may produce a second
        // client_auth.
        self.client_auth_sent = true;

        let result = self.process_server_hello(
            server_ephemeral_pub,
            server_identity_pub,
            server_signature,
            nonce_s,
            identity,
            device_id,
        );
        self.processing = false;
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    fn process_server_hello(
        &mut self,
        server_ephemeral_pub: &str,
        server_identity_pub: &str,
        server_signature: &str,
        nonce_s: &str,
        identity: &IdentityKeyPair,
        device_id: &str,
    ) -> Result<HandshakeOutcome, SyncError> {
        if let Some(pinned) = &self.pinned_server_key_hex {
            if pinned != server_identity_pub {
                return Err(SyncError::HandshakeRejected(
                    "server identity key does not match pinned key".into(),
                ));
            }
            let digest = hash::server_signature_digest(
                server_identity_pub,
                server_ephemeral_pub,
                &self.nonce_c,
                nonce_s,
            );
            identity::verify_hex(server_identity_pub, &digest, server_signature)
                .map_err(|_| SyncError::HandshakeRejected("bad server signature".into()))?;
        }

        let ephemeral = self
            .ephemeral
            .as_ref()
            .ok_or_else(|| SyncError::HandshakeRejected("no ephemeral key".into()))?;
        let shared_secret = ephemeral
            .agree(server_ephemeral_pub)
            .map_err(|e| SyncError::HandshakeRejected(format!("key agreement failed: {e}")))?;
        let session_key = kdf::derive_session_key(
            &shared_secret,
            ephemeral.public_hex(),
            server_ephemeral_pub,
        )?;

        let digest = hash::client_signature_digest(
            identity.public_hex(),
            device_id,
            &self.nonce_c,
            nonce_s,
            server_ephemeral_pub,
        );
        let client_signature = identity.sign_hex(&digest);
        let nonce_c2 = hash::handshake_nonce();

        self.session_key = Some(session_key);
        self.server_ephemeral_pub = Some(server_ephemeral_pub.to_string());
        self.nonce_s = Some(nonce_s.to_string());
        self.state = HandshakeState::AwaitingSessionEstablished;

        Ok(HandshakeOutcome::Send(Frame::ClientAuth {
            user_id: identity.public_hex().to_string(),
            device_id: device_id.to_string(),
            client_signature,
            nonce: nonce_c2,
        }))
    }

    fn on_session_established(
        &mut self,
        last_ack_device_seq: u64,
        expires_at: i64,
    ) -> Result<HandshakeOutcome, SyncError> {
        if self.state != HandshakeState::AwaitingSessionEstablished {
            debug!("session_established in wrong state — ignored");
            return Ok(HandshakeOutcome::Ignored);
        }
        let session_key = self
            .session_key
            .take()
            .ok_or_else(|| SyncError::HandshakeRejected("no session key derived".into()))?;

        // Destroy transient material.
        self.ephemeral = None;
        self.server_ephemeral_pub = None;
        self.nonce_s = None;
        self.nonce_c.clear();
        self.state = HandshakeState::Established;

        info!(last_ack_device_seq, "session established");
        Ok(HandshakeOutcome::Established(Box::new(SessionInfo {
            session_key,
            last_ack_device_seq,
            expires_at,
        })))
    }
}
