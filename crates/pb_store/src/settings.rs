//! Typed accessors over the settings key/value table: identity keypair,
//! device record, relay endpoint, acknowledgement high-water mark.

use sqlx::Row;
use uuid::Uuid;

use pb_crypto::identity::IdentityKeyPair;

use crate::{
    db::Store,
    error::StoreError,
    models::{DeviceRecord, DeviceType},
};

mod keys {
    pub const IDENTITY_PUBLIC: &str = "identity_public_hex";
    pub const IDENTITY_SECRET: &str = "identity_secret_hex";
    pub const DEVICE_ID: &str = "device_id";
    pub const DEVICE_NAME: &str = "device_name";
    pub const DEVICE_TYPE: &str = "device_type";
    pub const WS_URL: &str = "ws_url";
    pub const LAST_ACK: &str = "last_ack_device_seq";
}

#[derive(Clone)]
pub struct Settings {
    store: Store,
}

impl Settings {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.store.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.store.pool)
        .await?;
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM settings WHERE key = ?")
            .bind(key)
            .execute(&self.store.pool)
            .await?;
        Ok(())
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// Load the persisted identity, creating one on first run.
    pub async fn load_or_create_identity(&self) -> Result<IdentityKeyPair, StoreError> {
        if let Some(identity) = self.load_identity().await? {
            return Ok(identity);
        }
        let identity = IdentityKeyPair::generate();
        self.replace_identity(&identity).await?;
        Ok(identity)
    }

    pub async fn load_identity(&self) -> Result<Option<IdentityKeyPair>, StoreError> {
        match self.get(keys::IDENTITY_SECRET).await? {
            Some(secret_hex) => {
                let identity = IdentityKeyPair::from_secret_hex(&secret_hex)?;
                Ok(Some(identity))
            }
            None => Ok(None),
        }
    }

    /// Overwrite the identity keypair — pairing adoption and reset both
    /// land here.
    pub async fn replace_identity(&self, identity: &IdentityKeyPair) -> Result<(), StoreError> {
        self.set(keys::IDENTITY_PUBLIC, identity.public_hex()).await?;
        self.set(keys::IDENTITY_SECRET, &identity.secret_hex()).await?;
        Ok(())
    }

    pub async fn clear_identity(&self) -> Result<(), StoreError> {
        self.delete(keys::IDENTITY_PUBLIC).await?;
        self.delete(keys::IDENTITY_SECRET).await?;
        Ok(())
    }

    // ── Device record ────────────────────────────────────────────────────

    /// Load the device record, minting a fresh UUIDv4 id on first run.
    pub async fn load_or_create_device(
        &self,
        default_name: &str,
        device_type: DeviceType,
    ) -> Result<DeviceRecord, StoreError> {
        if let Some(record) = self.load_device().await? {
            return Ok(record);
        }
        let record = DeviceRecord {
            device_id: Uuid::new_v4().to_string(),
            device_name: default_name.to_string(),
            device_type,
        };
        self.set(keys::DEVICE_ID, &record.device_id).await?;
        self.set(keys::DEVICE_NAME, &record.device_name).await?;
        self.set(keys::DEVICE_TYPE, record.device_type.as_str()).await?;
        Ok(record)
    }

    pub async fn load_device(&self) -> Result<Option<DeviceRecord>, StoreError> {
        let Some(device_id) = self.get(keys::DEVICE_ID).await? else {
            return Ok(None);
        };
        let device_name = self.get(keys::DEVICE_NAME).await?.unwrap_or_default();
        let device_type = self
            .get(keys::DEVICE_TYPE)
            .await?
            .unwrap_or_else(|| "desktop".into())
            .parse::<DeviceType>()?;
        Ok(Some(DeviceRecord { device_id, device_name, device_type }))
    }

    /// The one sanctioned device-record mutation.
    pub async fn rename_device(&self, name: &str) -> Result<(), StoreError> {
        self.set(keys::DEVICE_NAME, name).await
    }

    // ── Endpoint & acknowledgements ──────────────────────────────────────

    pub async fn ws_url(&self) -> Result<Option<String>, StoreError> {
        self.get(keys::WS_URL).await
    }

    pub async fn set_ws_url(&self, url: &str) -> Result<(), StoreError> {
        self.set(keys::WS_URL, url).await
    }

    pub async fn last_ack_device_seq(&self) -> Result<u64, StoreError> {
        match self.get(keys::LAST_ACK).await? {
            Some(v) => v.parse::<u64>().map_err(|e| StoreError::Corrupt {
                key: keys::LAST_ACK.into(),
                reason: e.to_string(),
            }),
            None => Ok(0),
        }
    }

    pub async fn set_last_ack_device_seq(&self, value: u64) -> Result<(), StoreError> {
        self.set(keys::LAST_ACK, &value.to_string()).await
    }
}
