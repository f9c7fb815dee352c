//! Identity key management
//!
//! Each *user* has one long-term Ed25519 keypair. The hex-encoded public
//! key IS the user identifier; installing the same keypair on a second
//! device (via pairing) makes that device the same user.
//!
//! The secret half never leaves the process except inside a pairing
//! payload — pairing deliberately transfers identity.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier as _, VerifyingKey};
use rand::rngs::OsRng;
use zeroize::ZeroizeOnDrop;

use crate::error::CryptoError;

/// Long-term identity signing key. Drop clears memory via ZeroizeOnDrop.
#[derive(ZeroizeOnDrop)]
pub struct IdentityKeyPair {
    #[zeroize(skip)]
    public_hex: String,
    secret_bytes: [u8; 32],
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self::from_signing_key(signing_key)
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex)?;
        Self::from_secret_bytes(&bytes)
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKey(format!(
                "Identity secret must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(bytes);
        Ok(Self::from_signing_key(SigningKey::from_bytes(&arr)))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Self { public_hex, secret_bytes: signing_key.to_bytes() }
    }

    /// Hex public key — doubles as the user id everywhere in the protocol.
    pub fn public_hex(&self) -> &str {
        &self.public_hex
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret_bytes)
    }

    pub fn secret_bytes(&self) -> &[u8; 32] {
        &self.secret_bytes
    }

    /// Sign arbitrary bytes; returns the 64-byte raw Ed25519 signature.
    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        SigningKey::from_bytes(&self.secret_bytes)
            .sign(msg)
            .to_bytes()
            .to_vec()
    }

    /// Sign and hex-encode (the handshake carries signatures as hex).
    pub fn sign_hex(&self, msg: &[u8]) -> String {
        hex::encode(self.sign(msg))
    }
}

/// Verify a signature made by any Ed25519 public key (both hex-encoded).
pub fn verify_hex(public_hex: &str, msg: &[u8], sig_hex: &str) -> Result<(), CryptoError> {
    let public_bytes = hex::decode(public_hex)?;
    let sig_bytes = hex::decode(sig_hex)?;
    let vk = VerifyingKey::from_bytes(
        public_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad pubkey len".into()))?,
    )
    .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    let sig = Signature::from_bytes(
        sig_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("Bad sig len".into()))?,
    );
    vk.verify(msg, &sig)
        .map_err(|_| CryptoError::SignatureVerification)
}
