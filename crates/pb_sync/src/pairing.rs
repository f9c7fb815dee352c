//! Pairing coordinator — identity transfer over the relay's HTTP surface.
//!
//! Share: bind a random 6-digit code to a bundle carrying the identity
//! keypair (the point of pairing IS moving the identity). Receive: look
//! the code up, adopt the identity, invalidate the shared-key cache,
//! persist the endpoint, and nudge the Connection Manager to reconnect.
//!
//! Code generation is capped locally; the relay enforces expiry.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use tracing::{info, warn};

use pb_crypto::identity::IdentityKeyPair;
use pb_proto::pairing::{
    generate_code, PairingData, PairingLookupResponse, PairingStoreRequest, PairingStoreResponse,
};

use crate::{config::Config, connection::Command, context::Shared, error::SyncError};

const RATE_WINDOW: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct GeneratedPairing {
    pub code: String,
    pub expires_at: i64,
}

pub struct Pairing {
    shared: Arc<Shared>,
    http: reqwest::Client,
    recent_codes: Mutex<Vec<Instant>>,
}

impl Pairing {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            http: reqwest::Client::new(),
            recent_codes: Mutex::new(Vec::new()),
        }
    }

    async fn api_base(&self) -> Result<String, SyncError> {
        if let Some(base) = &self.shared.config.pairing_api_url {
            return Ok(base.trim_end_matches('/').to_string());
        }
        let ws_url = match &self.shared.config.ws_url {
            Some(url) => url.clone(),
            None => self
                .shared
                .settings
                .ws_url()
                .await?
                .ok_or_else(|| SyncError::Validation("no relay endpoint configured".into()))?,
        };
        Config::derive_pairing_api_url(&ws_url)
    }

    fn check_rate_limit(&self) -> Result<(), SyncError> {
        let mut recent = self.recent_codes.lock().expect("pairing state poisoned");
        let now = Instant::now();
        recent.retain(|t| now.duration_since(*t) < RATE_WINDOW);
        if recent.len() >= self.shared.config.pairing_codes_per_hour as usize {
            let oldest = recent[0];
            let retry_after = RATE_WINDOW.saturating_sub(now.duration_since(oldest));
            return Err(SyncError::RateLimited { retry_after_secs: retry_after.as_secs().max(1) });
        }
        Ok(())
    }

    /// Share this device's identity: store a pairing bundle on the relay
    /// under a fresh 6-digit code.
    pub async fn generate(&self) -> Result<GeneratedPairing, SyncError> {
        self.check_rate_limit()?;

        let identity = self
            .shared
            .settings
            .load_identity()
            .await?
            .ok_or(SyncError::NotInitialized)?;
        let device = self.shared.device();
        let ws_url = match &self.shared.config.ws_url {
            Some(url) => url.clone(),
            None => self
                .shared
                .settings
                .ws_url()
                .await?
                .ok_or_else(|| SyncError::Validation("no relay endpoint configured".into()))?,
        };

        let code = generate_code();
        let request = PairingStoreRequest {
            code: code.clone(),
            data: PairingData {
                ws_url,
                user_id: identity.public_hex().to_string(),
                device_id: device.device_id,
                device_name: device.device_name,
                identity_public_key_hex: identity.public_hex().to_string(),
                identity_private_key_hex: identity.secret_hex(),
            },
        };

        let base = self.api_base().await?;
        let response = self
            .http
            .post(format!("{base}/api/pairing/store"))
            .header("X-User-ID", identity.public_hex())
            .json(&request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SyncError::Validation(format!(
                "pairing store rejected: {}",
                response.status()
            )));
        }
        let body: PairingStoreResponse = response.json().await?;
        if !body.ok {
            return Err(SyncError::Validation("pairing store refused the code".into()));
        }

        self.recent_codes
            .lock()
            .expect("pairing state poisoned")
            .push(Instant::now());
        info!(code, "pairing code issued");
        Ok(GeneratedPairing { code, expires_at: body.expires_at })
    }

    /// Redeem a code from another device: adopt its identity and endpoint.
    pub async fn consume(&self, code: &str) -> Result<PairingData, SyncError> {
        if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
            return Err(SyncError::Validation("pairing code must be 6 digits".into()));
        }

        let base = self.api_base().await?;
        let response = self
            .http
            .get(format!("{base}/api/pairing/lookup/{code}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SyncError::Validation("unknown or expired pairing code".into()));
        }
        if !response.status().is_success() {
            return Err(SyncError::Validation(format!(
                "pairing lookup failed: {}",
                response.status()
            )));
        }
        let body: PairingLookupResponse = response.json().await?;
        let data = body
            .data
            .filter(|_| body.success)
            .ok_or_else(|| SyncError::Validation("unknown or expired pairing code".into()))?;

        self.adopt(&data).await?;
        Ok(data)
    }

    async fn adopt(&self, data: &PairingData) -> Result<(), SyncError> {
        let current = self.shared.user_id().ok();
        if current.as_deref() != Some(data.identity_public_key_hex.as_str()) {
            let identity = IdentityKeyPair::from_secret_hex(&data.identity_private_key_hex)?;
            if identity.public_hex() != data.identity_public_key_hex {
                return Err(SyncError::Validation(
                    "pairing bundle public key does not match its private key".into(),
                ));
            }
            warn!("adopting paired identity — local identity is replaced");
            self.shared.settings.replace_identity(&identity).await?;
            self.shared
                .set_identity_pub(Some(identity.public_hex().to_string()));
        }

        self.shared.settings.set_ws_url(&data.ws_url).await?;
        self.shared
            .settings
            .set("suggested_device_name", &data.device_name)
            .await?;

        // The core reloads identity state and rotates the connection.
        self.shared.send_command(Command::IdentityChanged).await?;
        Ok(())
    }
}
