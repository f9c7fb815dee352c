//! The external API — the one handle UI, service-worker, and background
//! schedulers consume.
//!
//! `PocketBridge::init` opens storage, ensures an identity and a device
//! record exist, and spawns the core task; everything after that is
//! either a snapshot read or a command round-trip into that task. There
//! are no process-wide singletons: drop the handle, and the core winds
//! down with it.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use pb_proto::Event;
use pb_store::{IntegrityReport, Store};

use crate::{
    config::Config,
    connection::{Command, Core},
    context::Shared,
    error::SyncError,
    features::{Clipboard, Files, Messages, Scratchpad},
    pairing::Pairing,
    subscribers::{ConnectionStatus, Subscription},
    transport::{Connector, WsConnector},
};

const COMMAND_CHANNEL_CAP: usize = 64;

#[derive(Debug, Clone, Copy)]
pub struct QueueStatus {
    pub pending_count: u64,
    pub pending_bytes: u64,
    pub last_ack_device_seq: u64,
    pub oldest_pending_created_at: Option<i64>,
}

pub struct PocketBridge {
    shared: Arc<Shared>,
    pub clipboard: Clipboard,
    pub scratchpad: Scratchpad,
    pub messages: Messages,
    pub files: Files,
    pub pairing: Pairing,
    core: tokio::task::JoinHandle<()>,
}

impl PocketBridge {
    /// Open the core against the production WebSocket connector.
    pub async fn init(config: Config) -> Result<Self, SyncError> {
        Self::init_with_connector(config, Arc::new(WsConnector)).await
    }

    /// Seam for tests and embedders with their own transport.
    pub async fn init_with_connector(
        config: Config,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, SyncError> {
        let store = match &config.db_path {
            Some(path) => Store::open(path).await?,
            None => Store::open_in_memory().await?,
        };
        let settings = pb_store::Settings::new(store.clone());
        let identity = settings.load_or_create_identity().await?;
        let device = settings
            .load_or_create_device(&config.device_name, config.device_type)
            .await?;
        info!(
            user_id = identity.public_hex(),
            device_id = device.device_id,
            "core initialised"
        );

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAP);
        let shared = Arc::new(Shared::new(
            config,
            store,
            cmd_tx,
            Some(identity.public_hex().to_string()),
            device,
        ));
        let core = Core::start(shared.clone(), connector, cmd_rx).await?;

        Ok(Self {
            clipboard: Clipboard::new(shared.clone()),
            scratchpad: Scratchpad::new(shared.clone()),
            messages: Messages::new(shared.clone()),
            files: Files::new(shared.clone()),
            pairing: Pairing::new(shared.clone()),
            shared,
            core,
        })
    }

    // ── Identity ─────────────────────────────────────────────────────────

    /// Idempotent: returns the current identity, creating one only when a
    /// reset removed it.
    pub async fn crypto_init(&self) -> Result<String, SyncError> {
        if let Ok(user_id) = self.shared.user_id() {
            return Ok(user_id);
        }
        let identity = self.shared.settings.load_or_create_identity().await?;
        self.shared
            .set_identity_pub(Some(identity.public_hex().to_string()));
        self.shared.send_command(Command::IdentityChanged).await?;
        Ok(identity.public_hex().to_string())
    }

    pub fn identity_public_key_hex(&self) -> Result<String, SyncError> {
        self.shared.user_id()
    }

    /// Explicit identity destruction. Every operation that needs the
    /// identity fails with `NotInitialized` until `crypto_init` runs.
    pub async fn reset_identity(&self) -> Result<(), SyncError> {
        self.shared.settings.clear_identity().await?;
        self.shared.set_identity_pub(None);
        self.shared.send_command(Command::IdentityChanged).await?;
        Ok(())
    }

    // ── Connection ───────────────────────────────────────────────────────

    pub async fn connect(&self) -> Result<(), SyncError> {
        self.shared.send_command(Command::Connect).await
    }

    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.shared.send_command(Command::Disconnect).await
    }

    /// Background-sync contract: an external scheduler asks the core to
    /// connect (if needed) and push whatever is pending.
    pub async fn sync_requested(&self) -> Result<(), SyncError> {
        self.shared.send_command(Command::SyncRequested).await
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.shared.subscribers.current_status()
    }

    pub fn subscribe_status(
        &self,
        handler: impl Fn(ConnectionStatus) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.subscribers.subscribe_status(handler)
    }

    pub fn subscribe_events(
        &self,
        handler: impl Fn(&Event) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.subscribers.subscribe_events(None, handler)
    }

    pub fn subscribe_errors(
        &self,
        handler: impl Fn(&SyncError) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.subscribers.subscribe_errors(handler)
    }

    // ── Queue & maintenance ──────────────────────────────────────────────

    pub async fn queue_status(&self) -> Result<QueueStatus, SyncError> {
        let user_id = self.shared.user_id()?;
        let device = self.shared.device();
        let last_ack = self.shared.settings.last_ack_device_seq().await?;
        let stats = self
            .shared
            .log
            .pending_stats(&user_id, &device.device_id, last_ack)
            .await?;
        Ok(QueueStatus {
            pending_count: stats.count,
            pending_bytes: stats.bytes,
            last_ack_device_seq: last_ack,
            oldest_pending_created_at: stats.oldest_created_at,
        })
    }

    pub async fn export(&self) -> Result<String, SyncError> {
        Ok(self.shared.maintenance.export().await?)
    }

    pub async fn import(&self, blob: &str) -> Result<u64, SyncError> {
        Ok(self.shared.maintenance.import(blob).await?)
    }

    pub async fn integrity_check(&self) -> Result<IntegrityReport, SyncError> {
        Ok(self.shared.maintenance.integrity_check().await?)
    }

    /// Wipe the event log and acknowledgement mark; identity and device
    /// record survive.
    pub async fn clear_data(&self) -> Result<(), SyncError> {
        Ok(self.shared.maintenance.clear().await?)
    }

    // ── Device record ────────────────────────────────────────────────────

    pub fn device(&self) -> pb_store::DeviceRecord {
        self.shared.device()
    }

    pub async fn rename_device(&self, name: &str) -> Result<(), SyncError> {
        if name.trim().is_empty() {
            return Err(SyncError::Validation("device name must not be empty".into()));
        }
        self.shared.settings.rename_device(name).await?;
        self.shared.set_device_name(name);
        Ok(())
    }

    // ── Shutdown ─────────────────────────────────────────────────────────

    pub async fn shutdown(self) -> Result<(), SyncError> {
        self.shared.send_command(Command::Shutdown).await?;
        let _ = self.core.await;
        Ok(())
    }
}
