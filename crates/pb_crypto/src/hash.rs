//! SHA-2 hash utilities.
//!
//! The handshake signature digests hash the UTF-8 bytes of hex/decimal
//! string concatenations — NOT raw key bytes. This matches the deployed
//! relay and must not be changed unilaterally; both sides would disagree
//! on every signature otherwise.

use sha2::{Digest, Sha256, Sha512};

pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

pub fn sha512(data: &[u8]) -> [u8; 64] {
    Sha512::digest(data).into()
}

/// SHA-256 over the UTF-8 concatenation of string components.
pub fn sha256_concat(parts: &[&str]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for p in parts {
        hasher.update(p.as_bytes());
    }
    hasher.finalize().into()
}

/// Digest the server signs during the handshake:
/// `SHA-256(server_identity_pub ‖ server_ephemeral_pub ‖ nonce_c ‖ nonce_s)`.
pub fn server_signature_digest(
    server_identity_pub: &str,
    server_ephemeral_pub: &str,
    nonce_c: &str,
    nonce_s: &str,
) -> [u8; 32] {
    sha256_concat(&[server_identity_pub, server_ephemeral_pub, nonce_c, nonce_s])
}

/// Digest the client signs during the handshake:
/// `SHA-256(user_id ‖ device_id ‖ nonce_c ‖ nonce_s ‖ server_ephemeral_pub)`.
pub fn client_signature_digest(
    user_id: &str,
    device_id: &str,
    nonce_c: &str,
    nonce_s: &str,
    server_ephemeral_pub: &str,
) -> [u8; 32] {
    sha256_concat(&[user_id, device_id, nonce_c, nonce_s, server_ephemeral_pub])
}

/// Hex SHA-256 of a plaintext file chunk (per-chunk integrity check).
pub fn chunk_hash(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

/// Fresh random nonce for handshake messages: 32 bytes, hex-encoded.
pub fn handshake_nonce() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concat_matches_manual_digest() {
        let joined = sha256(b"abcdef");
        let parts = sha256_concat(&["ab", "cd", "ef"]);
        assert_eq!(joined, parts);
    }

    #[test]
    fn signature_digests_are_order_sensitive() {
        let a = client_signature_digest("u", "d", "n1", "n2", "pk");
        let b = client_signature_digest("u", "d", "n2", "n1", "pk");
        assert_ne!(a, b);
    }

    #[test]
    fn handshake_nonce_is_32_bytes_hex() {
        let n = handshake_nonce();
        assert_eq!(n.len(), 64);
        assert!(hex::decode(&n).is_ok());
    }
}
