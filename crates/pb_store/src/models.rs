//! Row models — these map to/from SQL rows.

use serde::{Deserialize, Serialize};

use pb_proto::{Event, EventKind};

use crate::error::StoreError;

/// A log record: the wire event plus local-only bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    #[serde(flatten)]
    pub event: Event,
    /// Local receipt/emission time (unix ms); eviction fallback ordering.
    pub received_at: i64,
    /// True once `erase_payload` ran; the ciphertext column is then empty.
    pub payload_deleted: bool,
    pub deleted_at: Option<i64>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct EventRow {
    pub event_id: String,
    pub user_id: String,
    pub device_id: String,
    pub device_seq: i64,
    pub stream_id: String,
    pub stream_seq: i64,
    pub event_type: String,
    pub encrypted_payload: String,
    pub ttl: Option<i64>,
    pub created_at: Option<i64>,
    pub received_at: i64,
    pub payload_deleted: i64,
    pub deleted_at: Option<i64>,
}

impl EventRow {
    pub fn into_stored(self) -> Result<StoredEvent, StoreError> {
        let kind: EventKind =
            serde_json::from_value(serde_json::Value::String(self.event_type.clone())).map_err(
                |_| StoreError::Corrupt {
                    key: self.event_id.clone(),
                    reason: format!("unknown event type {}", self.event_type),
                },
            )?;
        Ok(StoredEvent {
            event: Event {
                event_id: self.event_id,
                user_id: self.user_id,
                device_id: self.device_id,
                device_seq: self.device_seq as u64,
                stream_id: self.stream_id,
                stream_seq: self.stream_seq as u64,
                kind,
                encrypted_payload: self.encrypted_payload,
                ttl: self.ttl,
                created_at: self.created_at,
            },
            received_at: self.received_at,
            payload_deleted: self.payload_deleted != 0,
            deleted_at: self.deleted_at,
        })
    }
}

/// Per-installation device record. Created once; only the name mutates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub device_name: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Mobile,
    Desktop,
    Web,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Mobile => "mobile",
            DeviceType::Desktop => "desktop",
            DeviceType::Web => "web",
        }
    }
}

impl std::str::FromStr for DeviceType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mobile" => Ok(DeviceType::Mobile),
            "desktop" => Ok(DeviceType::Desktop),
            "web" => Ok(DeviceType::Web),
            other => Err(StoreError::Corrupt {
                key: "device_type".into(),
                reason: format!("unknown device type {other}"),
            }),
        }
    }
}
