//! EntityStore trait: durable storage for notes and templates.
//!
//! Implementations:
//! - `InMemoryStore` - For testing
//! - `FileStore` (in collab-server) - JSON metadata plus snapshot files via tokio::fs
//!
//! The store is the only place a document's replicated state survives a
//! restart. It never interprets snapshot bytes.

use crate::room_id::{EntityKind, RoomId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use thiserror::Error;

/// Hard ceiling on a stored snapshot (15 MiB).
pub const MAX_SNAPSHOT_BYTES: usize = 15 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Snapshot too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Entity not found: {0}")]
    NotFound(RoomId),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Corrupt record for {0}: {1}")]
    Corrupt(RoomId, String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A persisted note or template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityRecord {
    pub kind: EntityKind,
    pub id: String,
    /// Legacy title, from before the entity was collaboratively edited
    #[serde(default)]
    pub title: Option<String>,
    /// Legacy HTML content
    #[serde(default)]
    pub content: Option<String>,
    /// Encoded full document state
    #[serde(skip)]
    pub snapshot: Option<Vec<u8>>,
    /// User IDs allowed to write. Empty means unrestricted.
    #[serde(default)]
    pub editors: Vec<String>,
}

impl EntityRecord {
    pub fn new(room: &RoomId) -> Self {
        Self {
            kind: room.kind(),
            id: room.entity_id().to_string(),
            title: None,
            content: None,
            snapshot: None,
            editors: Vec::new(),
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn with_content(mut self, html: impl Into<String>) -> Self {
        self.content = Some(html.into());
        self
    }

    pub fn with_editors<I, S>(mut self, editors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.editors = editors.into_iter().map(Into::into).collect();
        self
    }

    /// Whether `caller` may write this entity's snapshot.
    pub fn can_write(&self, caller: Option<&str>) -> bool {
        if self.editors.is_empty() {
            return true;
        }
        caller.is_some_and(|user| self.editors.iter().any(|e| e == user))
    }
}

/// Persisted snapshot store.
#[async_trait]
pub trait EntityStore: Send + Sync {
    /// Load an entity record; `Ok(None)` when absent.
    async fn fetch(&self, room: &RoomId) -> Result<Option<EntityRecord>>;

    /// Replace the stored snapshot of an existing entity.
    async fn save_snapshot(&self, room: &RoomId, snapshot: &[u8]) -> Result<()>;
}

/// Reject snapshots above [`MAX_SNAPSHOT_BYTES`].
pub fn check_size(size: usize) -> Result<()> {
    if size > MAX_SNAPSHOT_BYTES {
        Err(StoreError::TooLarge {
            size,
            limit: MAX_SNAPSHOT_BYTES,
        })
    } else {
        Ok(())
    }
}

/// In-memory store for testing
#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<RoomId, EntityRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record.
    pub fn put_entity(&self, record: EntityRecord) -> Result<()> {
        let room = RoomId::new(record.kind, &record.id)
            .map_err(|e| StoreError::Io(e.to_string()))?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        records.insert(room, record);
        Ok(())
    }

    /// Stored snapshot for a room, if any.
    pub fn snapshot(&self, room: &RoomId) -> Option<Vec<u8>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        records.get(room).and_then(|r| r.snapshot.clone())
    }
}

#[async_trait]
impl EntityStore for InMemoryStore {
    async fn fetch(&self, room: &RoomId) -> Result<Option<EntityRecord>> {
        let records = self.records.read().unwrap_or_else(|e| e.into_inner());
        Ok(records.get(room).cloned())
    }

    async fn save_snapshot(&self, room: &RoomId, snapshot: &[u8]) -> Result<()> {
        check_size(snapshot.len())?;
        let mut records = self.records.write().unwrap_or_else(|e| e.into_inner());
        let record = records
            .get_mut(room)
            .ok_or_else(|| StoreError::NotFound(room.clone()))?;
        record.snapshot = Some(snapshot.to_vec());
        Ok(())
    }
}

// Lets the registry, seeder and gateway share one store
#[async_trait]
impl<T: EntityStore + ?Sized> EntityStore for std::sync::Arc<T> {
    async fn fetch(&self, room: &RoomId) -> Result<Option<EntityRecord>> {
        (**self).fetch(room).await
    }

    async fn save_snapshot(&self, room: &RoomId, snapshot: &[u8]) -> Result<()> {
        (**self).save_snapshot(room, snapshot).await
    }
}
