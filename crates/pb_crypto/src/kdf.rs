//! Key derivation functions.
//!
//! `derive_shared_key` — the stable AES-256 event-encryption key. Derived
//!   deterministically from the identity secret, so every device holding
//!   the same identity produces the same key with no extra round-trips.
//!
//! `derive_session_key` — per-transport-session AES-256 key over the
//!   handshake ECDH secret. One key for both directions.

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::ZeroizeOnDrop;

use crate::{error::CryptoError, hash};

const SHARED_KEY_SALT_PREFIX: &str = "pocketbridge_shared_key_v1";
const SHARED_KEY_INFO: &[u8] = b"pocketbridge_event_encryption_v1";
const SESSION_KEY_INFO: &[u8] = b"pocketbridge_session_v1";

/// 32-byte symmetric key. Zeroized on drop.
#[derive(Clone, Debug, ZeroizeOnDrop)]
pub struct SymmetricKey(pub [u8; 32]);

impl SymmetricKey {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Expand `ikm` + `info` into `output.len()` bytes of key material.
pub fn hkdf_expand(
    ikm: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    output: &mut [u8],
) -> Result<(), CryptoError> {
    let hk = Hkdf::<Sha256>::new(salt, ikm);
    hk.expand(info, output)
        .map_err(|e| CryptoError::KeyDerivation(e.to_string()))
}

/// Derive the shared event-encryption key from the identity secret.
///
/// salt = SHA-256("pocketbridge_shared_key_v1" ‖ identity_public_key_hex)
/// info = "pocketbridge_event_encryption_v1"
pub fn derive_shared_key(
    identity_secret: &[u8; 32],
    identity_public_hex: &str,
) -> Result<SymmetricKey, CryptoError> {
    let salt = hash::sha256_concat(&[SHARED_KEY_SALT_PREFIX, identity_public_hex]);
    let mut key = [0u8; 32];
    hkdf_expand(identity_secret, Some(&salt), SHARED_KEY_INFO, &mut key)?;
    Ok(SymmetricKey(key))
}

/// Derive the session key from the handshake ECDH shared secret.
///
/// salt = SHA-256(client_ephemeral_pub_hex ‖ server_ephemeral_pub_hex)
/// info = "pocketbridge_session_v1"
pub fn derive_session_key(
    ecdh_secret: &[u8; 32],
    client_ephemeral_pub_hex: &str,
    server_ephemeral_pub_hex: &str,
) -> Result<SymmetricKey, CryptoError> {
    let salt = hash::sha256_concat(&[client_ephemeral_pub_hex, server_ephemeral_pub_hex]);
    let mut key = [0u8; 32];
    hkdf_expand(ecdh_secret, Some(&salt), SESSION_KEY_INFO, &mut key)?;
    Ok(SymmetricKey(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::IdentityKeyPair;

    #[test]
    fn shared_key_is_deterministic_per_identity() {
        let identity = IdentityKeyPair::generate();
        let a = derive_shared_key(identity.secret_bytes(), identity.public_hex()).unwrap();
        let b = derive_shared_key(identity.secret_bytes(), identity.public_hex()).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn different_identities_produce_different_keys() {
        let first = IdentityKeyPair::generate();
        let second = IdentityKeyPair::generate();
        let a = derive_shared_key(first.secret_bytes(), first.public_hex()).unwrap();
        let b = derive_shared_key(second.secret_bytes(), second.public_hex()).unwrap();
        assert_ne!(a.0, b.0);
    }

    #[test]
    fn session_key_matches_across_sides() {
        use crate::ecdh::EphemeralKeyPair;
        let client = EphemeralKeyPair::generate();
        let server = EphemeralKeyPair::generate();

        let client_secret = client.agree(server.public_hex()).unwrap();
        let server_secret = server.agree(client.public_hex()).unwrap();

        let a =
            derive_session_key(&client_secret, client.public_hex(), server.public_hex()).unwrap();
        let b =
            derive_session_key(&server_secret, client.public_hex(), server.public_hex()).unwrap();
        assert_eq!(a.0, b.0);
    }

    #[test]
    fn salt_order_matters_for_session_key() {
        use crate::ecdh::EphemeralKeyPair;
        let client = EphemeralKeyPair::generate();
        let server = EphemeralKeyPair::generate();
        let secret = client.agree(server.public_hex()).unwrap();

        let a = derive_session_key(&secret, client.public_hex(), server.public_hex()).unwrap();
        let b = derive_session_key(&secret, server.public_hex(), client.public_hex()).unwrap();
        assert_ne!(a.0, b.0);
    }
}
