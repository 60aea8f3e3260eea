//! Wire protocol for room connections.
//!
//! - Versioned JSON handshake sent by the server on attach
//! - Bincode sync frames for CRDT data and presence

pub mod handshake;
pub mod message;

pub use handshake::{Handshake, HandshakeRole, PROTOCOL_VERSION};
pub use message::{Frame, ProtocolError, SyncMessage};

/// Maximum inbound frame size (50MB) to prevent memory exhaustion from malicious peers.
pub const MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;
