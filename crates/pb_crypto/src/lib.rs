//! pb_crypto — PocketBridge cryptographic primitives
//!
//! # Design principles
//! - NO custom crypto; all primitives come from audited Rust crates.
//! - Zeroize secret material on drop.
//! - Public APIs return opaque newtypes to prevent accidental misuse.
//!
//! # Module layout
//! - `identity` — long-term Ed25519 identity keypair (public key hex = user id)
//! - `ecdh`     — ephemeral P-256 key agreement for the session handshake
//! - `aead`     — AES-256-GCM encrypt/decrypt (12-byte nonce ‖ ct+tag, base64)
//! - `kdf`      — HKDF-SHA256 derivations: shared event key, session key
//! - `hash`     — SHA-256 / SHA-512 utilities, handshake signature digests
//! - `error`    — unified error type

pub mod aead;
pub mod ecdh;
pub mod error;
pub mod hash;
pub mod identity;
pub mod kdf;

pub use error::CryptoError;
