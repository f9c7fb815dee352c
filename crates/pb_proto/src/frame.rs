//! Duplex channel frames.
//!
//! Every frame is a JSON object `{ "type": <tag>, "payload": <object> }`.
//! Unknown `type` tags are surfaced as [`Inbound::Unknown`] so the
//! connection layer can log and drop them without failing the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{error::ProtoError, event::Event};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Frame {
    // ── Handshake ────────────────────────────────────────────────────────
    ClientHello {
        /// Hex uncompressed SEC1 P-256 point.
        client_ephemeral_pub: String,
        /// 32 random bytes, hex.
        nonce: String,
    },
    ServerHello {
        server_ephemeral_pub: String,
        server_identity_pub: String,
        /// Ed25519 over SHA-256(identity ‖ ephemeral ‖ nonce_c ‖ nonce_s), hex.
        server_signature: String,
        nonce: String,
    },
    ClientAuth {
        user_id: String,
        device_id: String,
        /// Ed25519 over SHA-256(user ‖ device ‖ nonce_c ‖ nonce_s ‖ eph), hex.
        client_signature: String,
        nonce: String,
    },
    SessionEstablished {
        device_id: String,
        last_ack_device_seq: u64,
        /// Session expiry, unix ms.
        expires_at: i64,
    },

    // ── Data plane ───────────────────────────────────────────────────────
    /// Payload is the event record itself.
    Event(Event),
    Ack {
        device_seq: u64,
        /// Which device's sequence is being acknowledged. Absent means the
        /// receiver's own device (the common server→client case).
        #[serde(skip_serializing_if = "Option::is_none")]
        device_id: Option<String>,
    },
    ReplayRequest {
        last_ack_device_seq: u64,
        limit: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation_token: Option<String>,
    },
    ReplayResponse {
        events: Vec<Event>,
        has_more: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        continuation_token: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        total_events: Option<u64>,
    },

    // ── Server control ───────────────────────────────────────────────────
    SessionExpiringSoon {
        expires_in_seconds: u64,
        expires_at: i64,
    },
    FullResyncRequired {
        reason: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        recommendation: Option<String>,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl Frame {
    /// Data-plane frames may only flow once the session is ESTABLISHED;
    /// handshake frames are the only traffic allowed before that.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            Frame::ClientHello { .. }
                | Frame::ServerHello { .. }
                | Frame::ClientAuth { .. }
                | Frame::SessionEstablished { .. }
        )
    }

    pub fn type_tag(&self) -> &'static str {
        match self {
            Frame::ClientHello { .. } => "client_hello",
            Frame::ServerHello { .. } => "server_hello",
            Frame::ClientAuth { .. } => "client_auth",
            Frame::SessionEstablished { .. } => "session_established",
            Frame::Event(_) => "event",
            Frame::Ack { .. } => "ack",
            Frame::ReplayRequest { .. } => "replay_request",
            Frame::ReplayResponse { .. } => "replay_response",
            Frame::SessionExpiringSoon { .. } => "session_expiring_soon",
            Frame::FullResyncRequired { .. } => "full_resync_required",
            Frame::Error { .. } => "error",
        }
    }

    pub fn encode(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// A decoded inbound frame, or the type tag of one we don't understand.
#[derive(Debug)]
pub enum Inbound {
    Frame(Frame),
    Unknown(String),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    frame_type: String,
    #[serde(default)]
    #[allow(dead_code)]
    payload: Value,
}

const KNOWN_TYPES: &[&str] = &[
    "client_hello",
    "server_hello",
    "client_auth",
    "session_established",
    "event",
    "ack",
    "replay_request",
    "replay_response",
    "session_expiring_soon",
    "full_resync_required",
    "error",
];

/// Decode one frame of wire text. A recognised `type` with a malformed
/// payload is an error; an unrecognised `type` is [`Inbound::Unknown`].
pub fn decode(text: &str) -> Result<Inbound, ProtoError> {
    let raw: RawFrame =
        serde_json::from_str(text).map_err(|e| ProtoError::MalformedFrame(e.to_string()))?;
    if !KNOWN_TYPES.contains(&raw.frame_type.as_str()) {
        return Ok(Inbound::Unknown(raw.frame_type));
    }
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| ProtoError::MalformedFrame(e.to_string()))?;
    Ok(Inbound::Frame(frame))
}
