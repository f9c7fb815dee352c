//! Offline maintenance: export, import, integrity check, clear.
//!
//! Export blobs are JSON and include the settings table, so they carry
//! the identity secret — they are backups, not share artifacts.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use tracing::warn;

use crate::{
    db::Store,
    error::StoreError,
    event_log::EventLog,
    models::{EventRow, StoredEvent},
    settings::Settings,
};

const EXPORT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct ExportBlob {
    pub version: u32,
    pub exported_at: i64,
    pub settings: std::collections::BTreeMap<String, String>,
    pub events: Vec<StoredEvent>,
}

#[derive(Debug, Default, Serialize)]
pub struct IntegrityReport {
    pub events_total: u64,
    pub undecodable_payloads: u64,
    pub sequence_regressions: u64,
    pub counter_behind_log: bool,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.undecodable_payloads == 0 && self.sequence_regressions == 0 && !self.counter_behind_log
    }
}

pub struct Maintenance {
    store: Store,
}

impl Maintenance {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn export(&self) -> Result<String, StoreError> {
        let mut settings = std::collections::BTreeMap::new();
        let rows = sqlx::query("SELECT key, value FROM settings")
            .fetch_all(&self.store.pool)
            .await?;
        for row in rows {
            settings.insert(row.get::<String, _>(0), row.get::<String, _>(1));
        }

        let rows: Vec<EventRow> = sqlx::query_as("SELECT * FROM events ORDER BY received_at")
            .fetch_all(&self.store.pool)
            .await?;
        let events = rows
            .into_iter()
            .map(EventRow::into_stored)
            .collect::<Result<Vec<_>, _>>()?;

        let blob = ExportBlob {
            version: EXPORT_VERSION,
            exported_at: crate::now_ms(),
            settings,
            events,
        };
        Ok(serde_json::to_string(&blob)?)
    }

    /// Merge an export blob: settings are upserted, events appended
    /// idempotently (existing ids win).
    pub async fn import(&self, blob: &str) -> Result<u64, StoreError> {
        let blob: ExportBlob =
            serde_json::from_str(blob).map_err(|e| StoreError::Import(e.to_string()))?;
        if blob.version != EXPORT_VERSION {
            return Err(StoreError::Import(format!(
                "unsupported export version {}",
                blob.version
            )));
        }

        let settings = Settings::new(self.store.clone());
        for (key, value) in &blob.settings {
            settings.set(key, value).await?;
        }

        let log = EventLog::new(self.store.clone());
        let mut imported = 0u64;
        for stored in &blob.events {
            if log.append(&stored.event).await? {
                imported += 1;
            }
            if stored.payload_deleted {
                // Carry erasure over; a backup must not resurrect payloads.
                let _ = log.erase_payload(&stored.event.event_id).await;
            }
        }
        Ok(imported)
    }

    /// Offline consistency sweep. Read-only.
    pub async fn integrity_check(&self) -> Result<IntegrityReport, StoreError> {
        let mut report = IntegrityReport::default();

        let rows: Vec<EventRow> =
            sqlx::query_as("SELECT * FROM events ORDER BY device_id, device_seq")
                .fetch_all(&self.store.pool)
                .await?;
        report.events_total = rows.len() as u64;

        let mut prev: Option<(String, i64)> = None;
        for row in &rows {
            // Ciphertext must be valid base64 (or erased).
            if row.payload_deleted == 0 && STANDARD.decode(&row.encrypted_payload).is_err() {
                report.undecodable_payloads += 1;
            }
            // device_seq strictly increasing per device.
            if let Some((ref device, seq)) = prev {
                if *device == row.device_id && row.device_seq <= seq {
                    report.sequence_regressions += 1;
                }
            }
            prev = Some((row.device_id.clone(), row.device_seq));
        }

        // Our own counter must be at or past every logged sequence.
        let settings = Settings::new(self.store.clone());
        if let Some(device) = settings.load_device().await? {
            let max_logged = sqlx::query(
                "SELECT COALESCE(MAX(device_seq), 0) FROM events WHERE device_id = ?",
            )
            .bind(&device.device_id)
            .fetch_one(&self.store.pool)
            .await?
            .get::<i64, _>(0);
            let counter = crate::sequence::SequenceAllocator::load(self.store.clone())
                .await?
                .current();
            report.counter_behind_log = (counter as i64) < max_logged;
        }

        if !report.is_clean() {
            warn!(?report, "integrity check found inconsistencies");
        }
        Ok(report)
    }

    /// Wipe the event log and the acknowledgement mark. Identity and the
    /// device record survive; `Settings::clear_identity` is the separate,
    /// deliberate reset.
    pub async fn clear(&self) -> Result<(), StoreError> {
        EventLog::new(self.store.clone()).clear().await?;
        Settings::new(self.store.clone())
            .set_last_ack_device_seq(0)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pb_proto::{event::streams, Event, EventKind};

    fn event(device_seq: u64) -> Event {
        Event {
            event_id: Event::new_id(),
            user_id: "user-a".into(),
            device_id: "device-a".into(),
            device_seq,
            stream_id: streams::CLIPBOARD.into(),
            stream_seq: 0,
            kind: EventKind::ClipboardText,
            encrypted_payload: STANDARD.encode(b"ciphertext"),
            ttl: None,
            created_at: None,
        }
    }

    #[tokio::test]
    async fn export_import_round_trip() {
        let store = Store::open_in_memory().await.unwrap();
        let log = EventLog::new(store.clone());
        let settings = Settings::new(store.clone());
        settings.set_ws_url("wss://relay.example/ws").await.unwrap();
        for seq in 1..=3u64 {
            log.append(&event(seq)).await.unwrap();
        }
        let blob = Maintenance::new(store).export().await.unwrap();

        let fresh = Store::open_in_memory().await.unwrap();
        let imported = Maintenance::new(fresh.clone()).import(&blob).await.unwrap();
        assert_eq!(imported, 3);
        assert_eq!(EventLog::new(fresh.clone()).count().await.unwrap(), 3);
        assert_eq!(
            Settings::new(fresh).ws_url().await.unwrap().as_deref(),
            Some("wss://relay.example/ws")
        );
    }

    #[tokio::test]
    async fn import_does_not_resurrect_erased_payloads() {
        let store = Store::open_in_memory().await.unwrap();
        let log = EventLog::new(store.clone());
        let ev = event(1);
        log.append(&ev).await.unwrap();
        log.erase_payload(&ev.event_id).await.unwrap();
        let blob = Maintenance::new(store).export().await.unwrap();

        let fresh = Store::open_in_memory().await.unwrap();
        Maintenance::new(fresh.clone()).import(&blob).await.unwrap();
        let stored = EventLog::new(fresh)
            .get(&ev.event_id)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.payload_deleted);
        assert!(stored.event.encrypted_payload.is_empty());
    }

    #[tokio::test]
    async fn integrity_flags_bad_base64() {
        let store = Store::open_in_memory().await.unwrap();
        let log = EventLog::new(store.clone());
        let mut ev = event(1);
        ev.encrypted_payload = "not base64 !!!".into();
        log.append(&ev).await.unwrap();

        let report = Maintenance::new(store).integrity_check().await.unwrap();
        assert_eq!(report.undecodable_payloads, 1);
        assert!(!report.is_clean());
    }

    #[tokio::test]
    async fn clear_resets_log_and_ack() {
        let store = Store::open_in_memory().await.unwrap();
        let log = EventLog::new(store.clone());
        let settings = Settings::new(store.clone());
        log.append(&event(1)).await.unwrap();
        settings.set_last_ack_device_seq(5).await.unwrap();

        Maintenance::new(store.clone()).clear().await.unwrap();
        assert_eq!(log.count().await.unwrap(), 0);
        assert_eq!(settings.last_ack_device_seq().await.unwrap(), 0);
    }
}
