use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    #[error("Payload type mismatch: expected {expected}, got {got}")]
    PayloadMismatch { expected: String, got: String },

    #[error("Serialisation error: {0}")]
    Serialisation(#[from] serde_json::Error),

    #[error("Base64 decode error: {0}")]
    Base64Decode(#[from] base64::DecodeError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] pb_crypto::CryptoError),
}
