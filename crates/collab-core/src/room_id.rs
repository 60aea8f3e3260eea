//! RoomId: address of one collaborative document.
//!
//! A room is rendered as `{kind}-{entity_id}` (e.g. `note-42`). Upgrade paths
//! are classified once, at the multiplexer boundary, into a [`RoomRoute`].

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

/// Longest entity id accepted in a room identifier.
pub const MAX_ENTITY_ID_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomIdError {
    #[error("Invalid room ID format: expected `note-<id>` or `template-<id>`")]
    InvalidFormat,
    #[error("Unknown entity kind: {0}")]
    UnknownKind(String),
    #[error("Invalid entity ID: {0:?}")]
    InvalidEntityId(String),
}

/// The two kinds of collaboratively edited entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Note,
    Template,
}

impl EntityKind {
    /// Prefix used in room identifiers (`note`, `template`).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Note => "note",
            Self::Template => "template",
        }
    }

    /// Plural collection name used in REST paths (`notes`, `templates`).
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Note => "notes",
            Self::Template => "templates",
        }
    }

    /// Parse a REST collection segment.
    pub fn from_collection(segment: &str) -> Option<Self> {
        match segment {
            "notes" => Some(Self::Note),
            "templates" => Some(Self::Template),
            _ => None,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "note" => Ok(Self::Note),
            "template" => Ok(Self::Template),
            other => Err(RoomIdError::UnknownKind(other.to_string())),
        }
    }
}

/// Identifier of a room, and of the entity backing it.
///
/// # Examples
/// ```
/// use collab_core::{EntityKind, RoomId};
///
/// let room: RoomId = "note-42".parse().unwrap();
/// assert_eq!(room.kind(), EntityKind::Note);
/// assert_eq!(room.entity_id(), "42");
/// assert_eq!(room.to_string(), "note-42");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomId {
    kind: EntityKind,
    entity_id: String,
}

impl RoomId {
    /// Build a room id, validating the entity id.
    pub fn new(kind: EntityKind, entity_id: &str) -> Result<Self, RoomIdError> {
        if !is_valid_entity_id(entity_id) {
            return Err(RoomIdError::InvalidEntityId(entity_id.to_string()));
        }
        Ok(Self {
            kind,
            entity_id: entity_id.to_string(),
        })
    }

    pub fn note(entity_id: &str) -> Result<Self, RoomIdError> {
        Self::new(EntityKind::Note, entity_id)
    }

    pub fn template(entity_id: &str) -> Result<Self, RoomIdError> {
        Self::new(EntityKind::Template, entity_id)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }
}

impl Display for RoomId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.kind, self.entity_id)
    }
}

impl FromStr for RoomId {
    type Err = RoomIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, entity_id) = s.split_once('-').ok_or(RoomIdError::InvalidFormat)?;
        Self::new(kind.parse()?, entity_id)
    }
}

// Serialize as the display form for logs and JSON
impl Serialize for RoomId {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn is_valid_entity_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ENTITY_ID_LEN
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// Classification of an inbound upgrade path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomRoute {
    Note(String),
    Template(String),
    Rejected,
}

impl RoomRoute {
    /// Classify a request path such as `/note-42` or `/template-7?token=x`.
    ///
    /// Only a single path segment of the form `{kind}-{id}` is accepted.
    pub fn classify(path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or_default();
        let Some(segment) = path.strip_prefix('/') else {
            return Self::Rejected;
        };
        let segment = segment.strip_suffix('/').unwrap_or(segment);
        if segment.contains('/') {
            return Self::Rejected;
        }

        match segment.parse::<RoomId>() {
            Ok(room) => match room.kind {
                EntityKind::Note => Self::Note(room.entity_id),
                EntityKind::Template => Self::Template(room.entity_id),
            },
            Err(_) => Self::Rejected,
        }
    }

    /// The room addressed by this route, if it was accepted.
    pub fn room_id(&self) -> Option<RoomId> {
        match self {
            Self::Note(id) => Some(RoomId {
                kind: EntityKind::Note,
                entity_id: id.clone(),
            }),
            Self::Template(id) => Some(RoomId {
                kind: EntityKind::Template,
                entity_id: id.clone(),
            }),
            Self::Rejected => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let room = RoomId::note("42").unwrap();
        assert_eq!(room.to_string(), "note-42");
        let room = RoomId::template("abc_def").unwrap();
        assert_eq!(room.to_string(), "template-abc_def");
    }

    #[test]
    fn test_parse() {
        let room: RoomId = "template-7".parse().unwrap();
        assert_eq!(room.kind(), EntityKind::Template);
        assert_eq!(room.entity_id(), "7");
    }

    #[test]
    fn test_parse_keeps_dashes_in_entity_id() {
        let room: RoomId = "note-550e8400-e29b-41d4".parse().unwrap();
        assert_eq!(room.kind(), EntityKind::Note);
        assert_eq!(room.entity_id(), "550e8400-e29b-41d4");
    }

    #[test]
    fn test_parse_rejects_unknown_kind() {
        assert_eq!(
            "notebook-1".parse::<RoomId>(),
            Err(RoomIdError::UnknownKind("notebook".into()))
        );
    }

    #[test]
    fn test_parse_rejects_bad_ids() {
        assert!("note".parse::<RoomId>().is_err());
        assert!("note-".parse::<RoomId>().is_err());
        assert!("note-a b".parse::<RoomId>().is_err());
        assert!("note-../etc".parse::<RoomId>().is_err());
        assert!(format!("note-{}", "x".repeat(MAX_ENTITY_ID_LEN + 1))
            .parse::<RoomId>()
            .is_err());
    }

    #[test]
    fn test_classify_accepts_room_paths() {
        assert_eq!(RoomRoute::classify("/note-42"), RoomRoute::Note("42".into()));
        assert_eq!(
            RoomRoute::classify("/template-7/"),
            RoomRoute::Template("7".into())
        );
        assert_eq!(
            RoomRoute::classify("/note-42?token=abc"),
            RoomRoute::Note("42".into())
        );
    }

    #[test]
    fn test_classify_rejects_other_paths() {
        assert_eq!(RoomRoute::classify("/"), RoomRoute::Rejected);
        assert_eq!(RoomRoute::classify(""), RoomRoute::Rejected);
        assert_eq!(RoomRoute::classify("note-42"), RoomRoute::Rejected);
        assert_eq!(RoomRoute::classify("/notes/42"), RoomRoute::Rejected);
        assert_eq!(RoomRoute::classify("/note-42/extra"), RoomRoute::Rejected);
        assert_eq!(RoomRoute::classify("/calendar-1"), RoomRoute::Rejected);
    }

    #[test]
    fn test_route_room_id() {
        let room = RoomRoute::classify("/template-9").room_id().unwrap();
        assert_eq!(room, RoomId::template("9").unwrap());
        assert!(RoomRoute::Rejected.room_id().is_none());
    }

    #[test]
    fn test_collection_names() {
        assert_eq!(EntityKind::from_collection("notes"), Some(EntityKind::Note));
        assert_eq!(
            EntityKind::from_collection("templates"),
            Some(EntityKind::Template)
        );
        assert_eq!(EntityKind::from_collection("note"), None);
        assert_eq!(EntityKind::Template.collection(), "templates");
    }

    #[test]
    fn test_serde_roundtrip() {
        let original = RoomId::note("42").unwrap();
        let json = serde_json::to_string(&original).unwrap();
        assert_eq!(json, "\"note-42\"");
        let parsed: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(original, parsed);
    }
}
