//! Collaborative scratchpad on `scratchpad:main`.
//!
//! One automerge document per adapter; local edits emit the binary
//! incremental update as a `scratchpad:op` event, inbound events apply
//! the update to the document. Applied remote updates are immediately
//! marked saved, so the next local `save_incremental` carries local
//! operations only — a device never re-emits what it received.
//!
//! Rebuild: a fresh document fed every stream event in canonical order
//! converges to the same text on every replica.

use std::sync::{Arc, Mutex};

use automerge::{transaction::Transactable, AutoCommit, ObjType, ReadDoc, ROOT};
use base64::{engine::general_purpose::STANDARD, Engine};
use tracing::{debug, warn};

use pb_proto::{
    event::streams,
    payload::ScratchpadOp,
    Event, EventKind, EventPayload,
};

use crate::{context::Shared, error::SyncError, subscribers::Subscription};

const TEXT_KEY: &str = "content";

/// The text object, when any replica has created it. Reads must not mint
/// a fresh object: two devices creating their own roots concurrently
/// would leave one side's edits under the losing key.
fn existing_text_obj(doc: &AutoCommit) -> Result<Option<automerge::ObjId>, SyncError> {
    match doc
        .get(ROOT, TEXT_KEY)
        .map_err(|e| SyncError::Validation(format!("document read failed: {e}")))?
    {
        Some((automerge::Value::Object(ObjType::Text), id)) => Ok(Some(id)),
        _ => Ok(None),
    }
}

pub struct Scratchpad {
    shared: Arc<Shared>,
    doc: Arc<Mutex<AutoCommit>>,
    /// Keeps the inbound-apply observer alive for the adapter's lifetime.
    _observer: Subscription,
}

/// Get-or-create, for edit paths only.
fn text_obj(doc: &mut AutoCommit) -> Result<automerge::ObjId, SyncError> {
    if let Some(id) = existing_text_obj(doc)? {
        return Ok(id);
    }
    doc.put_object(ROOT, TEXT_KEY, ObjType::Text)
        .map_err(|e| SyncError::Validation(format!("document init failed: {e}")))
}

/// Apply one decrypted scratchpad op to the document, discarding the
/// resulting save window so the change is never re-emitted as local.
fn apply_update(doc: &mut AutoCommit, update_b64: &str) -> Result<(), SyncError> {
    let bytes = STANDARD
        .decode(update_b64)
        .map_err(|e| SyncError::Validation(format!("bad update encoding: {e}")))?;
    doc.load_incremental(&bytes)
        .map_err(|e| SyncError::Validation(format!("update rejected: {e}")))?;
    let _ = doc.save_incremental();
    Ok(())
}

impl Scratchpad {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        let doc = Arc::new(Mutex::new(AutoCommit::new()));

        let observer_doc = doc.clone();
        let observer_shared = shared.clone();
        let observer = shared.subscribers.subscribe_events(
            Some(streams::SCRATCHPAD.to_string()),
            move |event| {
                Self::apply_inbound(&observer_shared, &observer_doc, event);
            },
        );

        Self { shared, doc, _observer: observer }
    }

    /// Inbound path — runs synchronously on the core task's dispatch, so
    /// it can only use the cached shared key.
    fn apply_inbound(shared: &Shared, doc: &Arc<Mutex<AutoCommit>>, event: &Event) {
        if event.kind != EventKind::ScratchpadOp {
            return;
        }
        let Some(key) = shared.cached_shared_key() else {
            debug!("no shared key cached — scratchpad event deferred to rebuild");
            return;
        };
        let bytes = match pb_crypto::aead::decrypt_b64(key.as_bytes(), &event.encrypted_payload) {
            Ok(bytes) => bytes,
            Err(_) => {
                debug!(event_id = %event.event_id, "undecryptable scratchpad event skipped");
                return;
            }
        };
        let op = match EventPayload::from_bytes(event.kind, &bytes) {
            Ok(EventPayload::Scratchpad(op)) => op,
            _ => {
                debug!(event_id = %event.event_id, "malformed scratchpad payload skipped");
                return;
            }
        };
        let ScratchpadOp::CrdtUpdate { update } = op;
        let mut doc = doc.lock().expect("scratchpad document poisoned");
        if let Err(e) = apply_update(&mut doc, &update) {
            warn!(error = %e, "scratchpad update rejected");
        }
    }

    /// Current document text. Empty until any replica has written.
    pub fn text(&self) -> Result<String, SyncError> {
        let doc = self.doc.lock().expect("scratchpad document poisoned");
        match existing_text_obj(&doc)? {
            Some(obj) => doc
                .text(&obj)
                .map_err(|e| SyncError::Validation(format!("document read failed: {e}"))),
            None => Ok(String::new()),
        }
    }

    /// Insert at `pos` (character index).
    pub async fn insert(&self, pos: usize, text: &str) -> Result<Option<Event>, SyncError> {
        self.edit(|doc, obj| {
            doc.splice_text(obj, pos, 0, text)
                .map_err(|e| SyncError::Validation(format!("edit rejected: {e}")))
        })
        .await
    }

    /// Delete `len` characters starting at `pos`.
    pub async fn delete(&self, pos: usize, len: usize) -> Result<Option<Event>, SyncError> {
        self.edit(|doc, obj| {
            doc.splice_text(obj, pos, len as isize, "")
                .map_err(|e| SyncError::Validation(format!("edit rejected: {e}")))
        })
        .await
    }

    /// Replace the whole text, splicing only the changed middle so
    /// concurrent edits merge instead of clobbering.
    pub async fn set_text(&self, new_text: &str) -> Result<Option<Event>, SyncError> {
        let current = self.text()?;
        if current == new_text {
            return Ok(None);
        }
        let old: Vec<char> = current.chars().collect();
        let new: Vec<char> = new_text.chars().collect();
        let prefix = old
            .iter()
            .zip(new.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let suffix = old[prefix..]
            .iter()
            .rev()
            .zip(new[prefix..].iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        let del = old.len() - prefix - suffix;
        let insert: String = new[prefix..new.len() - suffix].iter().collect();

        self.edit(|doc, obj| {
            doc.splice_text(obj, prefix, del as isize, &insert)
                .map_err(|e| SyncError::Validation(format!("edit rejected: {e}")))
        })
        .await
    }

    async fn edit(
        &self,
        f: impl FnOnce(&mut AutoCommit, &automerge::ObjId) -> Result<(), SyncError>,
    ) -> Result<Option<Event>, SyncError> {
        let update = {
            let mut doc = self.doc.lock().expect("scratchpad document poisoned");
            let obj = text_obj(&mut doc)?;
            f(&mut doc, &obj)?;
            doc.save_incremental()
        };
        if update.is_empty() {
            return Ok(None);
        }
        let payload = EventPayload::Scratchpad(ScratchpadOp::CrdtUpdate {
            update: STANDARD.encode(update),
        });
        let event = self
            .shared
            .publish(streams::SCRATCHPAD.to_string(), payload, None)
            .await?;
        Ok(Some(event))
    }

    /// Rebuild the document from the event log: fresh document, every
    /// stream event applied in canonical order.
    pub async fn rebuild_from_log(&self) -> Result<String, SyncError> {
        let key = self.shared.shared_key().await?;
        let mut fresh = AutoCommit::new();
        for stored in self.shared.log.stream_events(streams::SCRATCHPAD).await? {
            if stored.payload_deleted || stored.event.kind != EventKind::ScratchpadOp {
                continue;
            }
            let bytes =
                match pb_crypto::aead::decrypt_b64(key.as_bytes(), &stored.event.encrypted_payload)
                {
                    Ok(bytes) => bytes,
                    Err(_) => {
                        debug!(event_id = %stored.event.event_id, "undecryptable scratchpad event skipped");
                        continue;
                    }
                };
            if let Ok(EventPayload::Scratchpad(ScratchpadOp::CrdtUpdate { update })) =
                EventPayload::from_bytes(stored.event.kind, &bytes)
            {
                if let Err(e) = apply_update(&mut fresh, &update) {
                    warn!(error = %e, "rebuild skipped one update");
                }
            }
        }

        let text = {
            let mut doc = self.doc.lock().expect("scratchpad document poisoned");
            *doc = fresh;
            match existing_text_obj(&doc)? {
                Some(obj) => doc
                    .text(&obj)
                    .map_err(|e| SyncError::Validation(format!("document read failed: {e}")))?,
                None => String::new(),
            }
        };
        Ok(text)
    }

    pub fn observe(&self, handler: impl Fn(&Event) + Send + Sync + 'static) -> Subscription {
        self.shared
            .subscribers
            .subscribe_events(Some(streams::SCRATCHPAD.to_string()), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_update_merges_and_discards_save_window() {
        let mut source = AutoCommit::new();
        let obj = text_obj(&mut source).unwrap();
        source.splice_text(&obj, 0, 0, "hello").unwrap();
        let update = source.save_incremental();

        let mut replica = AutoCommit::new();
        apply_update(&mut replica, &STANDARD.encode(&update)).unwrap();
        let obj = text_obj(&mut replica).unwrap();
        assert_eq!(replica.text(&obj).unwrap(), "hello");

        // The applied remote change must not look like local work.
        assert!(replica.save_incremental().is_empty());
    }

    #[test]
    fn replicas_converge_under_any_application_order() {
        let mut a = AutoCommit::new();
        let obj_a = text_obj(&mut a).unwrap();
        a.splice_text(&obj_a, 0, 0, "shared base").unwrap();
        let base = a.save_incremental();

        // Replica b starts from the same base, then both edit concurrently.
        let mut b = AutoCommit::new();
        apply_update(&mut b, &STANDARD.encode(&base)).unwrap();

        a.splice_text(&obj_a, 0, 0, "A:").unwrap();
        let update_a = a.save_incremental();

        let obj_b = text_obj(&mut b).unwrap();
        b.splice_text(&obj_b, 11, 0, ":B").unwrap();
        let update_b = b.save_incremental();

        apply_update(&mut a, &STANDARD.encode(&update_b)).unwrap();
        apply_update(&mut b, &STANDARD.encode(&update_a)).unwrap();

        let obj_a2 = text_obj(&mut a).unwrap();
        let text_a = a.text(&obj_a2).unwrap();
        let obj_b2 = text_obj(&mut b).unwrap();
        let text_b = b.text(&obj_b2).unwrap();
        assert_eq!(text_a, text_b);
        assert!(text_a.contains("shared base"));
    }

    #[test]
    fn garbage_update_is_rejected_not_fatal() {
        let mut doc = AutoCommit::new();
        assert!(apply_update(&mut doc, "AAAA").is_err());
        assert!(apply_update(&mut doc, "!!not-base64!!").is_err());
    }
}
