//! Clipboard stream — last write wins.
//!
//! Every change is one event on `clipboard:main`; the current clipboard
//! is the payload of the event with the highest relay ordering (device
//! ordering for events the relay has not numbered). Duplicate and empty
//! submissions are suppressed against the last text this process sent.

use std::sync::{Arc, Mutex};

use tracing::debug;

use pb_proto::{
    event::streams,
    payload::ClipboardPayload,
    Event, EventKind, EventPayload,
};

use crate::{context::Shared, error::SyncError, subscribers::Subscription};

pub struct Clipboard {
    shared: Arc<Shared>,
    last_sent: Mutex<Option<String>>,
}

impl Clipboard {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared, last_sent: Mutex::new(None) }
    }

    /// Publish a clipboard snapshot. Returns None when the input was
    /// suppressed (empty, or identical to the previous send).
    pub async fn send_text(&self, text: &str) -> Result<Option<Event>, SyncError> {
        if text.is_empty() {
            return Ok(None);
        }
        {
            let last = self.last_sent.lock().expect("clipboard state poisoned");
            if last.as_deref() == Some(text) {
                debug!("duplicate clipboard text suppressed");
                return Ok(None);
            }
        }

        let payload = EventPayload::Clipboard(ClipboardPayload { text: text.to_string() });
        let event = self
            .shared
            .publish(streams::CLIPBOARD.to_string(), payload, None)
            .await?;
        *self.last_sent.lock().expect("clipboard state poisoned") = Some(text.to_string());
        Ok(Some(event))
    }

    /// The latest clipboard text across all devices, from the local log.
    pub async fn latest_text(&self) -> Result<Option<String>, SyncError> {
        let events = self.shared.log.stream_events(streams::CLIPBOARD).await?;
        // stream_events yields canonical order; walk from the newest.
        for stored in events.iter().rev() {
            if stored.payload_deleted || stored.event.kind != EventKind::ClipboardText {
                continue;
            }
            match self.shared.open_payload(&stored.event).await {
                Ok(EventPayload::Clipboard(p)) => return Ok(Some(p.text)),
                Ok(_) => continue,
                Err(SyncError::DecryptFailed) => {
                    debug!(event_id = %stored.event.event_id, "undecryptable clipboard event skipped");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Observe clipboard events as they arrive.
    pub fn observe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.shared
            .subscribers
            .subscribe_events(Some(streams::CLIPBOARD.to_string()), handler)
    }
}
