//! pb_store — durable local storage for PocketBridge
//!
//! SQLite via sqlx, WAL mode, migrations on open. Event payloads arrive
//! here already encrypted under the shared key, so the store itself holds
//! no plaintext; the identity keypair in `settings` is the only secret at
//! rest and is expected to live under OS-protected app storage.
//!
//! # Modules
//! - `db`          — pool/open/migrations
//! - `models`      — row types
//! - `event_log`   — append-only log, indices, bounded eviction
//! - `sequence`    — persisted per-device monotonic counter
//! - `settings`    — identity, device record, endpoint, counters
//! - `maintenance` — export / import / integrity check / clear

pub mod db;
pub mod error;
pub mod event_log;
pub mod maintenance;
pub mod models;
pub mod sequence;
pub mod settings;

pub use db::Store;
pub use error::StoreError;
pub use event_log::{EventLog, PendingStats, QueueBounds};
pub use maintenance::{IntegrityReport, Maintenance};
pub use models::{DeviceRecord, DeviceType, StoredEvent};
pub use sequence::SequenceAllocator;
pub use settings::Settings;

/// Local wall clock, unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
