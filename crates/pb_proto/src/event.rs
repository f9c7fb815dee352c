//! The encrypted event record — the unit of synchronization.
//!
//! The relay sees every field except the plaintext: `encrypted_payload`
//! is AES-256-GCM under the user's shared key (per-file keys add a second
//! envelope for chunk data). `event_id` is a UUIDv7, time-ordered by
//! construction, and doubles as the idempotency token on ingest.

use serde::{Deserialize, Serialize};

/// Closed set of event types. One variant per `type` tag on the wire;
/// the owning feature adapter holds the encode/decode pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "clipboard:text")]
    ClipboardText,
    #[serde(rename = "scratchpad:op")]
    ScratchpadOp,
    #[serde(rename = "message:self_destruct")]
    MessageSelfDestruct,
    #[serde(rename = "file:metadata")]
    FileMetadata,
    #[serde(rename = "file:chunk")]
    FileChunk,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ClipboardText => "clipboard:text",
            EventKind::ScratchpadOp => "scratchpad:op",
            EventKind::MessageSelfDestruct => "message:self_destruct",
            EventKind::FileMetadata => "file:metadata",
            EventKind::FileChunk => "file:chunk",
        }
    }
}

/// Well-known stream names.
pub mod streams {
    pub const CLIPBOARD: &str = "clipboard:main";
    pub const SCRATCHPAD: &str = "scratchpad:main";
    pub const MESSAGES: &str = "messages:main";
    pub const FILES: &str = "files:main";

    /// Chunk stream for one file transfer: `files:main:<file-uuid>`.
    pub fn file_chunks(file_id: &str) -> String {
        format!("{FILES}:{file_id}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// UUIDv7 — primary key, idempotency token, monotonic by creation time.
    pub event_id: String,

    /// Sender's identity public key, hex. Must match the sender's current
    /// identity at emission time.
    pub user_id: String,

    /// Source device (UUIDv4, fixed per installation).
    pub device_id: String,

    /// Strictly monotonic per device, ≥ 1.
    pub device_seq: u64,

    /// Feature-owned stream name, e.g. `clipboard:main`.
    pub stream_id: String,

    /// Assigned by the relay on ingestion; 0 until then.
    #[serde(default)]
    pub stream_seq: u64,

    #[serde(rename = "type")]
    pub kind: EventKind,

    /// base64(12-byte nonce ‖ AES-GCM ciphertext+tag), shared-key encrypted.
    pub encrypted_payload: String,

    /// Expiration wall-clock (unix ms). Past this the event is treated as
    /// absent by feature adapters; the record itself stays for replay
    /// accounting.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,

    /// Server-assigned ingestion time (unix ms).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
}

impl Event {
    /// Fresh time-ordered event id.
    pub fn new_id() -> String {
        uuid::Uuid::now_v7().to_string()
    }

    /// Canonical per-stream ordering key: relay-assigned `stream_seq` when
    /// present, falling back to `device_seq` for events the relay has not
    /// numbered yet.
    pub fn order_key(&self) -> u64 {
        if self.stream_seq > 0 {
            self.stream_seq
        } else {
            self.device_seq
        }
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        matches!(self.ttl, Some(t) if t <= now_ms)
    }
}
