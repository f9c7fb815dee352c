//! pb_sync — PocketBridge synchronization core
//!
//! Maintains a secure, authenticated, durable, ordered stream of
//! encrypted events between this device, a relay, and the user's other
//! devices. The UI, notifications, and service-worker plumbing live
//! elsewhere and talk to [`PocketBridge`].
//!
//! # Architecture
//! One core task owns the transport, the handshake, the sequence
//! allocator, and every log mutation; the rest of the crate reaches it
//! through a command channel. Feature adapters translate domain
//! operations into encrypted events and decrypt lazily on read.
//!
//! # Module layout
//! - `client`      — the external API root handle
//! - `config`      — recognised options and defaults
//! - `connection`  — Connection Manager (core task, reconnect, buffers)
//! - `sync`        — Sync Engine (replay, acks, queue drain)
//! - `handshake`   — four-message session establishment
//! - `builder`     — event construction
//! - `transport`   — WebSocket transport behind a test seam
//! - `features`    — clipboard / scratchpad / messages / files adapters
//! - `pairing`     — pairing-code identity transfer
//! - `subscribers` — status/event/error subscriptions
//! - `context`     — shared state handed to adapters
//! - `error`       — unified error type

pub mod client;
pub mod config;
pub mod error;
pub mod features;
pub mod pairing;
pub mod subscribers;
pub mod transport;

mod builder;
mod connection;
mod context;
mod handshake;
mod sync;

pub use client::{PocketBridge, QueueStatus};
pub use config::Config;
pub use error::SyncError;
pub use features::{ActiveMessage, Clipboard, FileTransfer, Files, Messages, Scratchpad};
pub use pairing::{GeneratedPairing, Pairing};
pub use subscribers::{ConnectionStatus, Subscription};
pub use transport::{Connector, Transport, TransportEvent};
