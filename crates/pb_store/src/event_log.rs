//! Append-only event log with bounded pending storage.
//!
//! Keyed by `event_id`; `(device_id, device_seq)` is unique. Append is
//! idempotent — a second insert of any existing key is silently dropped,
//! which is exactly the replay-dedup behaviour the sync protocol relies on.
//!
//! The Pending Queue is not a separate structure: it is the predicate
//! `device_seq > last_ack_device_seq AND user_id = <current identity>`
//! over this table. Bounds apply to that subset; eviction removes the
//! oldest pending events (relay `created_at`, local receipt time as the
//! fallback) in batches of 100.

use sqlx::Row;
use tracing::{debug, warn};

use pb_proto::Event;

use crate::{
    db::Store,
    error::StoreError,
    models::{EventRow, StoredEvent},
    now_ms,
};

const EVICTION_BATCH: i64 = 100;

#[derive(Debug, Clone, Copy)]
pub struct QueueBounds {
    pub max_count: u64,
    pub max_bytes: u64,
}

impl Default for QueueBounds {
    fn default() -> Self {
        Self { max_count: 10_000, max_bytes: 100 * 1024 * 1024 }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PendingStats {
    pub count: u64,
    pub bytes: u64,
    pub oldest_created_at: Option<i64>,
}

/// Log accessor. Cheap to clone; shares the store's pool.
#[derive(Clone)]
pub struct EventLog {
    store: Store,
}

impl EventLog {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Idempotent append. Returns true when the event was newly inserted,
    /// false when `event_id` (or the `(device_id, device_seq)` pair) was
    /// already present — the stored copy always wins.
    pub async fn append(&self, event: &Event) -> Result<bool, StoreError> {
        let received_at = event.created_at.unwrap_or_else(now_ms);
        let result = sqlx::query(
            "INSERT OR IGNORE INTO events \
             (event_id, user_id, device_id, device_seq, stream_id, stream_seq, \
              event_type, encrypted_payload, ttl, created_at, received_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.event_id)
        .bind(&event.user_id)
        .bind(&event.device_id)
        .bind(event.device_seq as i64)
        .bind(&event.stream_id)
        .bind(event.stream_seq as i64)
        .bind(event.kind.as_str())
        .bind(&event.encrypted_payload)
        .bind(event.ttl)
        .bind(event.created_at)
        .bind(received_at)
        .execute(&self.store.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if !inserted {
            debug!(event_id = %event.event_id, "duplicate event ignored");
        }
        Ok(inserted)
    }

    /// Adopt the relay-assigned stream sequence for an event we already
    /// hold (our own events come back numbered during replay).
    pub async fn set_stream_seq(&self, event_id: &str, stream_seq: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE events SET stream_seq = ? WHERE event_id = ? AND stream_seq = 0")
            .bind(stream_seq as i64)
            .bind(event_id)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        let row: Option<EventRow> = sqlx::query_as("SELECT * FROM events WHERE event_id = ?")
            .bind(event_id)
            .fetch_optional(&self.store.pool)
            .await?;
        row.map(EventRow::into_stored).transpose()
    }

    /// All events of one stream in canonical replay order: relay-assigned
    /// `stream_seq` first, unnumbered events after by `device_seq`.
    pub async fn stream_events(&self, stream_id: &str) -> Result<Vec<StoredEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM events WHERE stream_id = ? \
             ORDER BY CASE WHEN stream_seq > 0 THEN 0 ELSE 1 END, \
                      CASE WHEN stream_seq > 0 THEN stream_seq ELSE device_seq END",
        )
        .bind(stream_id)
        .fetch_all(&self.store.pool)
        .await?;
        rows.into_iter().map(EventRow::into_stored).collect()
    }

    /// Streams whose id starts with `prefix:` — file chunk streams hang
    /// off `files:main` this way.
    pub async fn streams_with_prefix(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let pattern = format!("{prefix}:%");
        let rows = sqlx::query("SELECT DISTINCT stream_id FROM events WHERE stream_id LIKE ?")
            .bind(pattern)
            .fetch_all(&self.store.pool)
            .await?;
        Ok(rows.into_iter().map(|r| r.get::<String, _>(0)).collect())
    }

    /// The Pending Queue, in emission (`device_seq`) order.
    pub async fn pending(
        &self,
        user_id: &str,
        device_id: &str,
        last_ack_device_seq: u64,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let rows: Vec<EventRow> = sqlx::query_as(
            "SELECT * FROM events \
             WHERE user_id = ? AND device_id = ? AND device_seq > ? \
             ORDER BY device_seq",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(last_ack_device_seq as i64)
        .fetch_all(&self.store.pool)
        .await?;
        rows.into_iter().map(EventRow::into_stored).collect()
    }

    pub async fn pending_stats(
        &self,
        user_id: &str,
        device_id: &str,
        last_ack_device_seq: u64,
    ) -> Result<PendingStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*), COALESCE(SUM(LENGTH(encrypted_payload)), 0), \
                    MIN(COALESCE(created_at, received_at)) \
             FROM events WHERE user_id = ? AND device_id = ? AND device_seq > ?",
        )
        .bind(user_id)
        .bind(device_id)
        .bind(last_ack_device_seq as i64)
        .fetch_one(&self.store.pool)
        .await?;
        Ok(PendingStats {
            count: row.get::<i64, _>(0) as u64,
            bytes: row.get::<i64, _>(1) as u64,
            oldest_created_at: row.get::<Option<i64>, _>(2),
        })
    }

    /// Evict oldest pending events, 100 at a time, until both bounds hold.
    /// Returns the number of evicted events.
    pub async fn enforce_bounds(
        &self,
        user_id: &str,
        device_id: &str,
        last_ack_device_seq: u64,
        bounds: QueueBounds,
    ) -> Result<u64, StoreError> {
        let mut evicted = 0u64;
        loop {
            let stats = self.pending_stats(user_id, device_id, last_ack_device_seq).await?;
            if stats.count <= bounds.max_count && stats.bytes <= bounds.max_bytes {
                break;
            }
            let result = sqlx::query(
                "DELETE FROM events WHERE event_id IN ( \
                     SELECT event_id FROM events \
                     WHERE user_id = ? AND device_id = ? AND device_seq > ? \
                     ORDER BY COALESCE(created_at, received_at) \
                     LIMIT ?)",
            )
            .bind(user_id)
            .bind(device_id)
            .bind(last_ack_device_seq as i64)
            .bind(EVICTION_BATCH)
            .execute(&self.store.pool)
            .await?;
            let batch = result.rows_affected();
            if batch == 0 {
                break;
            }
            evicted += batch;
        }
        if evicted > 0 {
            warn!(evicted, "pending queue over bounds — evicted oldest events");
        }
        Ok(evicted)
    }

    /// Overwrite the ciphertext with empty and mark the payload deleted.
    /// The event row survives for replay accounting.
    pub async fn erase_payload(&self, event_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE events SET encrypted_payload = '', payload_deleted = 1, deleted_at = ? \
             WHERE event_id = ?",
        )
        .bind(now_ms())
        .bind(event_id)
        .execute(&self.store.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(event_id.to_string()));
        }
        Ok(())
    }

    pub async fn count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) FROM events")
            .fetch_one(&self.store.pool)
            .await?;
        Ok(row.get::<i64, _>(0) as u64)
    }

    /// Full wipe — used by `full_resync_required` and `data.clear`.
    pub async fn clear(&self) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM events")
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }
}
