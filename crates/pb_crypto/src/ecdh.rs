//! Ephemeral P-256 key agreement for the session handshake.
//!
//! Each handshake generates a fresh keypair on both sides; the ECDH shared
//! secret feeds the session-key HKDF (see `kdf::derive_session_key`).
//! Public keys travel as hex of the uncompressed SEC1 point (65 bytes).

use p256::{
    ecdh::EphemeralSecret,
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey,
};
use rand_core::OsRng;

use crate::error::CryptoError;

/// One side's ephemeral handshake keypair. Consumed by `agree`.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public_hex: String,
}

impl EphemeralKeyPair {
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random(&mut OsRng);
        let public_hex = hex::encode(secret.public_key().to_encoded_point(false).as_bytes());
        Self { secret, public_hex }
    }

    /// Uncompressed SEC1 point, hex — the wire representation.
    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    /// ECDH against the peer's hex-encoded public key.
    /// Returns the 32-byte x-coordinate shared secret.
    pub fn agree(&self, peer_public_hex: &str) -> Result<[u8; 32], CryptoError> {
        let peer = decode_public_hex(peer_public_hex)?;
        let shared = self.secret.diffie_hellman(&peer);
        let mut out = [0u8; 32];
        out.copy_from_slice(shared.raw_secret_bytes().as_slice());
        Ok(out)
    }
}

/// Parse a hex SEC1 point into a P-256 public key.
pub fn decode_public_hex(public_hex: &str) -> Result<PublicKey, CryptoError> {
    let bytes = hex::decode(public_hex)?;
    PublicKey::from_sec1_bytes(&bytes)
        .map_err(|e| CryptoError::InvalidKey(format!("invalid P-256 point: {e}")))
}
