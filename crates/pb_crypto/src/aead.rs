//! Authenticated encryption with AES-256-GCM.
//!
//! Key size: 32 bytes.  Nonce: 12 bytes (random).  Tag: 16 bytes.
//!
//! Wire format for every encrypted payload:
//!   base64( nonce (12 bytes) | ciphertext + tag )

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng as AeadOsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use zeroize::Zeroizing;

use crate::error::CryptoError;

pub const NONCE_LEN: usize = 12;

/// Generate a fresh 32-byte symmetric key (per-file encryption keys).
pub fn generate_key() -> [u8; 32] {
    use rand::RngCore;
    let mut key = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut key);
    key
}

/// Encrypt `plaintext` with a 32-byte key, prepending a random 12-byte nonce.
pub fn encrypt(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadEncrypt)?;
    let nonce = Aes256Gcm::generate_nonce(&mut AeadOsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|_| CryptoError::AeadEncrypt)?;

    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt wire-format bytes (nonce || ciphertext+tag).
pub fn decrypt(key: &[u8; 32], data: &[u8]) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    if data.len() < NONCE_LEN {
        return Err(CryptoError::AeadDecrypt);
    }
    let (nonce_bytes, ct) = data.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::AeadDecrypt)?;
    let plaintext = cipher
        .decrypt(nonce, ct)
        .map_err(|_| CryptoError::AeadDecrypt)?;
    Ok(Zeroizing::new(plaintext))
}

/// Encrypt and base64-encode — the shape every event payload uses.
pub fn encrypt_b64(key: &[u8; 32], plaintext: &[u8]) -> Result<String, CryptoError> {
    Ok(STANDARD.encode(encrypt(key, plaintext)?))
}

/// Decode base64 and decrypt.
pub fn decrypt_b64(key: &[u8; 32], b64: &str) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
    let data = STANDARD.decode(b64)?;
    decrypt(key, &data)
}
