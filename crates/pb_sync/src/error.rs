//! Unified error type for the sync core.
//!
//! Propagation policy:
//! - `Transport` / `HandshakeRejected` stay inside the Connection Manager
//!   (recovered by reconnecting) and reach the application only through
//!   the error subscription.
//! - `DecryptFailed` is swallowed at the decryption site with debug-level
//!   logging; inbound noise from other sessions is expected.
//! - `Validation`, `NotInitialized`, `RateLimited`, and `QueueBounded`
//!   cross the API boundary unchanged.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("core not initialised — create or adopt an identity first")]
    NotInitialized,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("payload failed authentication")]
    DecryptFailed,

    #[error("integrity failure: {0}")]
    IntegrityFailed(String),

    #[error("session expired")]
    SessionExpired,

    #[error("server requested full resync: {0}")]
    FullResyncRequired(String),

    #[error("rate limited — retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("pending queue at capacity")]
    QueueBounded,

    #[error("core task stopped")]
    CoreStopped,

    #[error(transparent)]
    Crypto(#[from] pb_crypto::CryptoError),

    #[error(transparent)]
    Proto(#[from] pb_proto::ProtoError),

    #[error(transparent)]
    Store(#[from] pb_store::StoreError),

    #[error("pairing endpoint error: {0}")]
    Http(#[from] reqwest::Error),
}
