//! Versioned handshake frame.
//!
//! The server sends this JSON frame first on every accepted connection, before
//! the baseline state. It tells the peer which room it landed in and the
//! connection ID used in server logs.

use crate::room_id::RoomId;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Role of the side sending the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandshakeRole {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Protocol version
    pub version: u32,
    /// Role in the connection
    pub role: HandshakeRole,
    /// Room the connection is attached to
    pub room: RoomId,
    /// Server-assigned connection ID (server handshakes only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

impl Handshake {
    /// Handshake sent by the server after attaching a connection to a room.
    pub fn server(room: RoomId, connection_id: impl Into<String>) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            role: HandshakeRole::Server,
            room,
            connection_id: Some(connection_id.into()),
        }
    }

    /// Handshake a client may send; the server ignores it beyond logging.
    pub fn client(room: RoomId) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            role: HandshakeRole::Client,
            room,
            connection_id: None,
        }
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Handshake serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"handshake"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;
        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::note("42").unwrap()
    }

    #[test]
    fn test_server_handshake() {
        let hs = Handshake::server(room(), "conn-1");

        assert_eq!(hs.msg_type, "handshake");
        assert_eq!(hs.version, PROTOCOL_VERSION);
        assert_eq!(hs.role, HandshakeRole::Server);
        assert_eq!(hs.connection_id.as_deref(), Some("conn-1"));
    }

    #[test]
    fn test_wire_format_server() {
        let hs = Handshake::server(room(), "conn-7");
        let json = String::from_utf8(hs.to_json()).unwrap();

        assert!(json.contains("\"type\":\"handshake\""));
        assert!(json.contains("\"version\":1"));
        assert!(json.contains("\"role\":\"server\""));
        assert!(json.contains("\"room\":\"note-42\""));
        assert!(json.contains("\"connectionId\":\"conn-7\""));
    }

    #[test]
    fn test_client_handshake_omits_connection_id() {
        let json = String::from_utf8(Handshake::client(room()).to_json()).unwrap();
        assert!(!json.contains("connectionId"));

        let parsed = Handshake::from_json(json.as_bytes()).unwrap();
        assert_eq!(parsed.role, HandshakeRole::Client);
        assert_eq!(parsed.room, room());
    }

    #[test]
    fn test_rejects_other_json() {
        assert!(Handshake::from_json(br#"{"type":"sync","data":[]}"#).is_none());
        assert!(Handshake::from_json(b"not json").is_none());
    }

    #[test]
    fn test_version_warning() {
        let mut hs = Handshake::client(room());
        assert!(!hs.should_warn_version());
        hs.version = PROTOCOL_VERSION + 1;
        assert!(hs.should_warn_version());
    }
}
