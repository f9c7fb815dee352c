//! Feature adapters — one per stream family.
//!
//! Each adapter owns the encode/decode pair for its payload shapes and
//! decrypts lazily with the shared key. Decrypt failures are swallowed at
//! debug level: an event we cannot open is cross-identity noise, not an
//! application fault.

pub mod clipboard;
pub mod files;
pub mod messages;
pub mod scratchpad;

pub use clipboard::Clipboard;
pub use files::{FileTransfer, Files};
pub use messages::{ActiveMessage, Messages};
pub use scratchpad::Scratchpad;
