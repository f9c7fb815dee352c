//! Plaintext payload variants — what lives inside `encrypted_payload`.
//!
//! A closed enum with one constructor per event type; the feature adapter
//! that owns the stream performs encode/encrypt and decrypt/decode, so the
//! event log and the relay never see these shapes.

use serde::{Deserialize, Serialize};

use crate::{
    error::ProtoError,
    event::EventKind,
};

/// Clipboard snapshot — last write wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardPayload {
    pub text: String,
}

/// One incremental CRDT update for the scratchpad document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScratchpadOp {
    CrdtUpdate {
        /// base64 of the binary update.
        update: String,
    },
}

/// Ephemeral message; `expiresAt` mirrors the event-level ttl.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfDestructPayload {
    pub text: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: i64,
}

/// Announces a file transfer on `files:main`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadataPayload {
    pub file_id: String,
    pub name: String,
    pub size: u64,
    pub mime_type: String,
    pub total_chunks: u32,
    /// Fresh per-file AES-256 key, base64. Only ever transmitted inside
    /// the shared-key envelope.
    pub encryption_key_b64: String,
}

/// One chunk on `files:main:<file_id>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkPayload {
    pub file_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    /// Doubly enveloped: base64(nonce ‖ AES-GCM under the per-file key),
    /// then this whole payload is encrypted under the shared key.
    pub data: String,
    /// SHA-256 of the plaintext chunk, hex.
    pub hash: String,
}

/// Closed variant over every payload shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    Clipboard(ClipboardPayload),
    Scratchpad(ScratchpadOp),
    SelfDestruct(SelfDestructPayload),
    FileMetadata(FileMetadataPayload),
    FileChunk(FileChunkPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Clipboard(_) => EventKind::ClipboardText,
            EventPayload::Scratchpad(_) => EventKind::ScratchpadOp,
            EventPayload::SelfDestruct(_) => EventKind::MessageSelfDestruct,
            EventPayload::FileMetadata(_) => EventKind::FileMetadata,
            EventPayload::FileChunk(_) => EventKind::FileChunk,
        }
    }

    /// UTF-8 JSON bytes, ready for the AEAD envelope.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtoError> {
        let bytes = match self {
            EventPayload::Clipboard(p) => serde_json::to_vec(p)?,
            EventPayload::Scratchpad(p) => serde_json::to_vec(p)?,
            EventPayload::SelfDestruct(p) => serde_json::to_vec(p)?,
            EventPayload::FileMetadata(p) => serde_json::to_vec(p)?,
            EventPayload::FileChunk(p) => serde_json::to_vec(p)?,
        };
        Ok(bytes)
    }

    /// Decode decrypted bytes according to the event's type tag.
    pub fn from_bytes(kind: EventKind, bytes: &[u8]) -> Result<Self, ProtoError> {
        let payload = match kind {
            EventKind::ClipboardText => EventPayload::Clipboard(serde_json::from_slice(bytes)?),
            EventKind::ScratchpadOp => EventPayload::Scratchpad(serde_json::from_slice(bytes)?),
            EventKind::MessageSelfDestruct => {
                EventPayload::SelfDestruct(serde_json::from_slice(bytes)?)
            }
            EventKind::FileMetadata => EventPayload::FileMetadata(serde_json::from_slice(bytes)?),
            EventKind::FileChunk => EventPayload::FileChunk(serde_json::from_slice(bytes)?),
        };
        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipboard_round_trip() {
        let payload = EventPayload::Clipboard(ClipboardPayload { text: "hello".into() });
        let bytes = payload.to_bytes().unwrap();
        let back = EventPayload::from_bytes(EventKind::ClipboardText, &bytes).unwrap();
        assert_eq!(payload, back);
    }

    #[test]
    fn scratchpad_op_wire_shape() {
        let op = ScratchpadOp::CrdtUpdate { update: "AQID".into() };
        let json = serde_json::to_string(&op).unwrap();
        assert_eq!(json, r#"{"type":"crdt_update","update":"AQID"}"#);
    }

    #[test]
    fn self_destruct_uses_camel_case_expiry() {
        let p = SelfDestructPayload { text: "ssh".into(), expires_at: 123 };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"expiresAt\":123"));
    }

    #[test]
    fn kind_tag_follows_variant() {
        let p = EventPayload::FileChunk(FileChunkPayload {
            file_id: "f".into(),
            chunk_index: 0,
            total_chunks: 1,
            data: "AA==".into(),
            hash: "00".into(),
        });
        assert_eq!(p.kind(), EventKind::FileChunk);
    }

    #[test]
    fn mismatched_kind_fails_decode() {
        let bytes = EventPayload::Clipboard(ClipboardPayload { text: "x".into() })
            .to_bytes()
            .unwrap();
        assert!(EventPayload::from_bytes(EventKind::FileMetadata, &bytes).is_err());
    }
}
