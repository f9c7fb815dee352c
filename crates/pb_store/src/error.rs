use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Identity not initialised")]
    NoIdentity,

    #[error("Corrupt stored value for {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Import rejected: {0}")]
    Import(String),

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] pb_crypto::CryptoError),
}
