//! Event construction: serialize → encrypt → stamp ids and sequence.
//!
//! Runs on the core task because the sequence allocation and the log
//! append must land in the same ordering domain as acknowledgement
//! processing. The allocator persists before the event exists, so a crash
//! can skip a sequence number but never reuse one.

use pb_crypto::{aead, kdf::SymmetricKey};
use pb_proto::{Event, EventPayload};
use pb_store::SequenceAllocator;

use crate::error::SyncError;

pub(crate) async fn build_event(
    shared_key: &SymmetricKey,
    user_id: &str,
    device_id: &str,
    stream_id: String,
    payload: &EventPayload,
    ttl: Option<i64>,
    allocator: &mut SequenceAllocator,
) -> Result<Event, SyncError> {
    let plaintext = payload.to_bytes()?;
    let encrypted_payload = aead::encrypt_b64(shared_key.as_bytes(), &plaintext)?;
    let device_seq = allocator.next().await?;

    Ok(Event {
        event_id: Event::new_id(),
        user_id: user_id.to_string(),
        device_id: device_id.to_string(),
        device_seq,
        stream_id,
        stream_seq: 0,
        kind: payload.kind(),
        encrypted_payload,
        ttl,
        created_at: None,
    })
}
