//! Self-destruct messages on `messages:main`.
//!
//! The payload carries its own expiry; the event-level ttl mirrors it so
//! the rest of the stack can treat expired events as absent without
//! decrypting anything. Deleting a message erases the stored ciphertext
//! but keeps the event row — replay accounting needs the sequence.

use std::sync::Arc;

use tracing::debug;

use pb_proto::{
    event::streams,
    payload::SelfDestructPayload,
    Event, EventKind, EventPayload,
};
use pb_store::now_ms;

use crate::{context::Shared, error::SyncError, subscribers::Subscription};

#[derive(Debug, Clone)]
pub struct ActiveMessage {
    pub event_id: String,
    pub from_device_id: String,
    pub text: String,
    pub expires_at: i64,
}

pub struct Messages {
    shared: Arc<Shared>,
}

impl Messages {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Send a message that expires `ttl_seconds` from now (config default
    /// when None).
    pub async fn send(&self, text: &str, ttl_seconds: Option<u64>) -> Result<Event, SyncError> {
        if text.is_empty() {
            return Err(SyncError::Validation("empty message".into()));
        }
        let ttl = ttl_seconds.unwrap_or(self.shared.config.ttl_default_seconds);
        let expires_at = now_ms() + (ttl as i64) * 1000;
        let payload = EventPayload::SelfDestruct(SelfDestructPayload {
            text: text.to_string(),
            expires_at,
        });
        self.shared
            .publish(streams::MESSAGES.to_string(), payload, Some(expires_at))
            .await
    }

    /// All unexpired, unerased messages, oldest first.
    pub async fn active(&self) -> Result<Vec<ActiveMessage>, SyncError> {
        let now = now_ms();
        let mut out = Vec::new();
        for stored in self.shared.log.stream_events(streams::MESSAGES).await? {
            if stored.payload_deleted
                || stored.event.kind != EventKind::MessageSelfDestruct
                || stored.event.is_expired(now)
            {
                continue;
            }
            match self.shared.open_payload(&stored.event).await {
                Ok(EventPayload::SelfDestruct(p)) => {
                    if p.expires_at > now {
                        out.push(ActiveMessage {
                            event_id: stored.event.event_id,
                            from_device_id: stored.event.device_id,
                            text: p.text,
                            expires_at: p.expires_at,
                        });
                    }
                }
                Ok(_) => continue,
                Err(SyncError::DecryptFailed) => {
                    debug!(event_id = %stored.event.event_id, "undecryptable message skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Local payload erasure. The event metadata stays so replay keeps
    /// its sequence accounting; only the ciphertext is destroyed.
    pub async fn delete_payload(&self, event_id: &str) -> Result<(), SyncError> {
        Ok(self.shared.log.erase_payload(event_id).await?)
    }

    pub fn observe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.shared
            .subscribers
            .subscribe_events(Some(streams::MESSAGES.to_string()), handler)
    }
}
