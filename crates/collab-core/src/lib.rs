//! collab-core: Shared library for collaborative note and template editing using Loro CRDTs.
//!
//! This crate provides:
//! - The replicated document wrapper for notes and templates
//! - Room identifiers and upgrade-path classification
//! - The sync wire protocol (handshake and sync frames)
//! - Legacy HTML translation used when seeding a room
//! - The EntityStore trait abstraction

pub mod document;
pub mod legacy;
pub mod protocol;
pub mod room_id;
pub mod store;

pub use document::{CollabDocument, DocumentError};
pub use legacy::{Block, BlockKind, LegacyError};
pub use protocol::{Frame, Handshake, ProtocolError, SyncMessage};
pub use room_id::{EntityKind, RoomId, RoomIdError, RoomRoute};
pub use store::{EntityRecord, EntityStore, InMemoryStore, MAX_SNAPSHOT_BYTES, StoreError};
