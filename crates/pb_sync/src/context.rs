//! Shared context handed to feature adapters and the external API.
//!
//! All mutation of connection/session/sequence state happens on the core
//! task; this context only carries what is safe to touch from any task:
//! snapshot reads of the store, the subscriber registry, the cached
//! shared key, and the command channel into the core.

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use pb_crypto::kdf::{self, SymmetricKey};
use pb_proto::{Event, EventPayload};
use pb_store::{DeviceRecord, EventLog, Maintenance, Settings, Store};

use crate::{
    config::Config,
    connection::Command,
    error::SyncError,
    subscribers::Subscribers,
};

pub(crate) struct Shared {
    pub config: Config,
    pub store: Store,
    pub log: EventLog,
    pub settings: Settings,
    pub maintenance: Maintenance,
    pub subscribers: Subscribers,
    pub cmd_tx: mpsc::Sender<Command>,

    shared_key: Mutex<Option<SymmetricKey>>,
    identity_pub: Mutex<Option<String>>,
    device: Mutex<DeviceRecord>,
}

impl Shared {
    pub fn new(
        config: Config,
        store: Store,
        cmd_tx: mpsc::Sender<Command>,
        identity_pub: Option<String>,
        device: DeviceRecord,
    ) -> Self {
        Self {
            log: EventLog::new(store.clone()),
            settings: Settings::new(store.clone()),
            maintenance: Maintenance::new(store.clone()),
            subscribers: Subscribers::default(),
            store,
            config,
            cmd_tx,
            shared_key: Mutex::new(None),
            identity_pub: Mutex::new(identity_pub),
            device: Mutex::new(device),
        }
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// Current user id (identity public key hex).
    pub fn user_id(&self) -> Result<String, SyncError> {
        self.identity_pub
            .lock()
            .expect("identity cache poisoned")
            .clone()
            .ok_or(SyncError::NotInitialized)
    }

    pub fn set_identity_pub(&self, public_hex: Option<String>) {
        *self.identity_pub.lock().expect("identity cache poisoned") = public_hex;
        self.invalidate_shared_key();
    }

    // ── Shared key cache ─────────────────────────────────────────────────

    /// Lazy derivation; one HKDF per identity lifetime.
    pub async fn shared_key(&self) -> Result<SymmetricKey, SyncError> {
        if let Some(key) = self.cached_shared_key() {
            return Ok(key);
        }
        let identity = self
            .settings
            .load_identity()
            .await?
            .ok_or(SyncError::NotInitialized)?;
        let key = kdf::derive_shared_key(identity.secret_bytes(), identity.public_hex())?;
        *self.shared_key.lock().expect("shared key cache poisoned") = Some(key.clone());
        Ok(key)
    }

    /// Synchronous view for observers running on the core task.
    pub fn cached_shared_key(&self) -> Option<SymmetricKey> {
        self.shared_key.lock().expect("shared key cache poisoned").clone()
    }

    pub fn invalidate_shared_key(&self) {
        debug!("shared key cache invalidated");
        *self.shared_key.lock().expect("shared key cache poisoned") = None;
    }

    // ── Device record ────────────────────────────────────────────────────

    pub fn device(&self) -> DeviceRecord {
        self.device.lock().expect("device cache poisoned").clone()
    }

    pub fn set_device_name(&self, name: &str) {
        self.device.lock().expect("device cache poisoned").device_name = name.to_string();
    }

    // ── Core task round-trips ────────────────────────────────────────────

    /// Build, persist, and (when connected) transmit one event. Resolves
    /// only after the append hit storage — a crash after this returns can
    /// never lose the operation.
    pub async fn publish(
        &self,
        stream_id: String,
        payload: EventPayload,
        ttl: Option<i64>,
    ) -> Result<Event, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { stream_id, payload, ttl, reply })
            .await
            .map_err(|_| SyncError::CoreStopped)?;
        rx.await.map_err(|_| SyncError::CoreStopped)?
    }

    pub async fn send_command(&self, command: Command) -> Result<(), SyncError> {
        self.cmd_tx.send(command).await.map_err(|_| SyncError::CoreStopped)
    }

    // ── Adapter-local decryption ─────────────────────────────────────────

    /// Decrypt an event payload under the shared key. Callers are expected
    /// to swallow `DecryptFailed` with debug logging — cross-session noise
    /// is normal, not an application error.
    pub async fn open_payload(&self, event: &Event) -> Result<EventPayload, SyncError> {
        let key = self.shared_key().await?;
        let bytes = pb_crypto::aead::decrypt_b64(key.as_bytes(), &event.encrypted_payload)
            .map_err(|_| SyncError::DecryptFailed)?;
        Ok(EventPayload::from_bytes(event.kind, &bytes)?)
    }
}
