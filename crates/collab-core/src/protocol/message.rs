//! Sync frames exchanged over a room connection.
//!
//! The protocol uses two encodings on binary WebSocket frames:
//! - **JSON**: the handshake (human-readable, starts with `{`)
//! - **Bincode**: [`SyncMessage`] frames carrying CRDT data
//!
//! Bincode encodes the enum variant as a little-endian `u32` first, so sync
//! frames never start with `{` or `[`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Empty frame")]
    Empty,

    #[error("Malformed sync frame: {0}")]
    Malformed(String),
}

/// Messages exchanged between a peer and its room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncMessage {
    /// Peer announces its version vector and asks for what it is missing.
    SyncStep1 {
        /// Encoded version vector
        version: Vec<u8>,
    },

    /// State the receiver is missing. The server sends the full document
    /// state in this form right after the handshake.
    SyncStep2 {
        /// Encoded update or full state
        update: Vec<u8>,
    },

    /// Incremental update produced by an edit (or a relayed delta).
    Update {
        /// Encoded update
        data: Vec<u8>,
    },

    /// Ephemeral presence data (cursors, user identity). Relayed, never stored.
    Awareness {
        /// Opaque client-defined payload
        data: Vec<u8>,
    },
}

impl SyncMessage {
    /// Serialize to bincode bytes.
    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("SyncMessage serialization should not fail")
    }

    /// Parse from bincode bytes.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Message name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SyncStep1 { .. } => "SyncStep1",
            Self::SyncStep2 { .. } => "SyncStep2",
            Self::Update { .. } => "Update",
            Self::Awareness { .. } => "Awareness",
        }
    }
}

/// A decoded inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// JSON control frame (e.g. a client handshake)
    Json(serde_json::Value),
    /// Bincode sync frame
    Sync(SyncMessage),
}

impl Frame {
    /// Decode raw frame bytes, detecting the encoding from the first byte.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        match data.first() {
            None => Err(ProtocolError::Empty),
            Some(b'{') | Some(b'[') => serde_json::from_slice(data)
                .map(Frame::Json)
                .map_err(|e| ProtocolError::Malformed(e.to_string())),
            Some(_) => SyncMessage::decode(data).map(Frame::Sync),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Handshake;
    use crate::RoomId;

    #[test]
    fn test_sync_message_roundtrip() {
        let msg = SyncMessage::Update {
            data: vec![1, 2, 3],
        };
        let parsed = SyncMessage::decode(&msg.encode()).unwrap();
        assert_eq!(msg, parsed);
    }

    #[test]
    fn test_sync_frames_never_look_like_json() {
        let frames = [
            SyncMessage::SyncStep1 { version: vec![b'{'] },
            SyncMessage::SyncStep2 { update: vec![] },
            SyncMessage::Update { data: vec![b'['] },
            SyncMessage::Awareness { data: vec![] },
        ];
        for msg in frames {
            let bytes = msg.encode();
            assert!(!matches!(bytes.first(), Some(b'{') | Some(b'[')));
            assert_eq!(Frame::decode(&bytes).unwrap(), Frame::Sync(msg));
        }
    }

    #[test]
    fn test_detects_json_handshake() {
        let hs = Handshake::client(RoomId::note("1").unwrap()).to_json();
        match Frame::decode(&hs).unwrap() {
            Frame::Json(value) => assert_eq!(value["type"], "handshake"),
            other => panic!("Expected JSON frame, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_and_garbage_frames() {
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            Frame::decode(&[0x09, 0x00, 0x00, 0x00]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            Frame::decode(b"{not json"),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_names() {
        assert_eq!(SyncMessage::Awareness { data: vec![] }.name(), "Awareness");
        assert_eq!(SyncMessage::SyncStep1 { version: vec![] }.name(), "SyncStep1");
    }
}
