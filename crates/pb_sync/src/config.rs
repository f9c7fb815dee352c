//! Core configuration.
//!
//! Every recognised knob with its reference default. `ws_url` here
//! overrides whatever pairing persisted; when absent the persisted
//! endpoint is used.

use pb_store::DeviceType;

use crate::error::SyncError;

#[derive(Debug, Clone)]
pub struct Config {
    /// Event-channel endpoint override. Pairing-supplied endpoints are
    /// persisted in the store and used when this is None.
    pub ws_url: Option<String>,
    /// Pairing HTTP endpoint; derived from the ws endpoint when absent.
    pub pairing_api_url: Option<String>,

    pub device_name: String,
    pub device_type: DeviceType,

    /// SQLite file. None runs fully in memory (tests, throwaway sessions).
    pub db_path: Option<std::path::PathBuf>,

    // File transfers
    pub chunk_size_bytes: usize,
    pub parallel_chunks: usize,
    pub max_file_bytes: u64,

    // Pending queue bounds
    pub queue_max_count: u64,
    pub queue_max_bytes: u64,

    // Timing
    pub handshake_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_max_ms: u64,
    pub keepalive_interval_ms: u64,
    pub replay_page_limit: u32,
    pub replay_page_timeout_ms: u64,
    pub replay_page_delay_ms: u64,

    /// Default lifetime for self-destruct messages.
    pub ttl_default_seconds: u64,

    /// Pairing-code generations allowed per rolling hour.
    pub pairing_codes_per_hour: u32,

    /// Optional pinned server identity key (hex). When set, the
    /// `server_hello` signature is verified; when unset the handshake is
    /// trust-on-first-use, matching the deployed profile.
    pub pinned_server_key_hex: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_url: None,
            pairing_api_url: None,
            device_name: "PocketBridge Device".into(),
            device_type: DeviceType::Desktop,
            db_path: None,
            chunk_size_bytes: 5 * 1024 * 1024,
            parallel_chunks: 10,
            max_file_bytes: 25 * 1024 * 1024 * 1024,
            queue_max_count: 10_000,
            queue_max_bytes: 100 * 1024 * 1024,
            handshake_timeout_ms: 10_000,
            reconnect_base_ms: 3_000,
            reconnect_max_ms: 30_000,
            keepalive_interval_ms: 30_000,
            replay_page_limit: 100,
            replay_page_timeout_ms: 30_000,
            replay_page_delay_ms: 100,
            ttl_default_seconds: 300,
            pairing_codes_per_hour: 3,
            pinned_server_key_hex: None,
        }
    }
}

impl Config {
    /// Derive the pairing HTTP base from an event-channel url:
    /// scheme ws→http / wss→https, trailing `/ws` stripped.
    pub fn derive_pairing_api_url(ws_url: &str) -> Result<String, SyncError> {
        let mut url = url::Url::parse(ws_url)
            .map_err(|e| SyncError::Validation(format!("bad ws_url {ws_url}: {e}")))?;
        let scheme = match url.scheme() {
            "ws" => Some("http"),
            "wss" => Some("https"),
            _ => None,
        };
        if let Some(scheme) = scheme {
            url.set_scheme(scheme)
                .map_err(|_| SyncError::Validation(format!("cannot rewrite scheme of {ws_url}")))?;
        }
        let path = url.path().trim_end_matches('/').to_string();
        if let Some(stripped) = path.strip_suffix("/ws") {
            url.set_path(stripped);
        } else if path == "/ws" || path.is_empty() {
            url.set_path("");
        }
        Ok(url.to_string().trim_end_matches('/').to_string())
    }
}
