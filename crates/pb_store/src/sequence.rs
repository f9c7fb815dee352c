//! Persisted per-device monotonic sequence counter.
//!
//! `next()` persists before returning, so a crash between allocation and
//! transmission can only ever waste a number — it can never reuse one.
//! Reconciliation against the server's `last_ack_device_seq` on every
//! session establishment is the defence against a counter that lags
//! storage after a restore-from-backup.

use sqlx::Row;
use tracing::info;

use crate::{db::Store, error::StoreError};

const KEY: &str = "device_seq";

pub struct SequenceAllocator {
    store: Store,
    current: u64,
}

impl SequenceAllocator {
    /// Load the persisted counter (0 when absent).
    pub async fn load(store: Store) -> Result<Self, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(KEY)
            .fetch_optional(&store.pool)
            .await?;
        let current = match row {
            Some(row) => row
                .get::<String, _>(0)
                .parse::<u64>()
                .map_err(|e| StoreError::Corrupt { key: KEY.into(), reason: e.to_string() })?,
            None => 0,
        };
        Ok(Self { store, current })
    }

    pub fn current(&self) -> u64 {
        self.current
    }

    /// Allocate the next sequence number, persisting it before return.
    pub async fn next(&mut self) -> Result<u64, StoreError> {
        let next = self.current + 1;
        self.persist(next).await?;
        self.current = next;
        Ok(next)
    }

    /// Advance the counter to the server-acknowledged high-water mark.
    /// No-op when the counter is already ahead.
    pub async fn reconcile(&mut self, last_ack_device_seq: u64) -> Result<(), StoreError> {
        if self.current < last_ack_device_seq {
            info!(
                from = self.current,
                to = last_ack_device_seq,
                "sequence counter behind server ack — advancing"
            );
            self.persist(last_ack_device_seq).await?;
            self.current = last_ack_device_seq;
        }
        Ok(())
    }

    async fn persist(&self, value: u64) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(KEY)
        .bind(value.to_string())
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }
}
