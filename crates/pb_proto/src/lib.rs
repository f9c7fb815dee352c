//! pb_proto — Wire types, events, and serialisation for PocketBridge
//!
//! Everything on the wire is JSON. A frame is `{ "type": ..., "payload": ... }`;
//! an event's `encrypted_payload` is opaque to the relay and to this crate —
//! the feature adapter that owns the stream decrypts it.
//!
//! # Modules
//! - `event`   — the encrypted event record (the unit of synchronization)
//! - `frame`   — duplex channel frames, one variant per wire `type`
//! - `payload` — plaintext payload variants (inside `encrypted_payload`)
//! - `pairing` — pairing-code HTTP surface types
//! - `error`   — unified error type

pub mod error;
pub mod event;
pub mod frame;
pub mod pairing;
pub mod payload;

pub use error::ProtoError;
pub use event::{Event, EventKind};
pub use frame::{Frame, Inbound};
pub use payload::EventPayload;
