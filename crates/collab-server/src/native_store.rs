//! File-backed entity store using tokio::fs.
//!
//! Layout under the data directory:
//!
//! ```text
//! notes/42.json       entity record (title, legacy content, editors)
//! notes/42.loro       stored snapshot
//! templates/7.json
//! ```
//!
//! Snapshots are written to a temporary file and renamed into place, so a
//! crash mid-write never leaves a torn snapshot behind.

use async_trait::async_trait;
use collab_core::store::{self, EntityRecord, EntityStore, Result, StoreError};
use collab_core::RoomId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

/// Native store implementation for the server
pub struct FileStore {
    base_path: PathBuf,
}

impl FileStore {
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    fn entity_path(&self, room: &RoomId, extension: &str) -> PathBuf {
        self.base_path
            .join(room.kind().collection())
            .join(format!("{}.{}", room.entity_id(), extension))
    }

    fn record_path(&self, room: &RoomId) -> PathBuf {
        self.entity_path(room, "json")
    }

    fn snapshot_path(&self, room: &RoomId) -> PathBuf {
        self.entity_path(room, "loro")
    }

    /// Create or replace an entity record, writing its snapshot too when one is set.
    pub async fn put_entity(&self, record: &EntityRecord) -> Result<()> {
        let room = RoomId::new(record.kind, &record.id).map_err(|e| StoreError::Io(e.to_string()))?;
        let content =
            serde_json::to_vec_pretty(record).map_err(|e| StoreError::Io(e.to_string()))?;
        write_atomic(&self.record_path(&room), &content).await?;
        if let Some(snapshot) = &record.snapshot {
            self.save_snapshot(&room, snapshot).await?;
        }
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(format!("{}: {}", path.display(), e))),
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let io_err = |e: std::io::Error| StoreError::Io(format!("{}: {}", path.display(), e));

    // Create parent directories if needed
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await.map_err(io_err)?;
    }

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content).await.map_err(io_err)?;
    fs::rename(&tmp, path).await.map_err(io_err)
}

#[async_trait]
impl EntityStore for FileStore {
    async fn fetch(&self, room: &RoomId) -> Result<Option<EntityRecord>> {
        let Some(content) = read_optional(&self.record_path(room)).await? else {
            return Ok(None);
        };
        let mut record: EntityRecord = serde_json::from_slice(&content)
            .map_err(|e| StoreError::Corrupt(room.clone(), e.to_string()))?;
        record.snapshot = read_optional(&self.snapshot_path(room)).await?;
        Ok(Some(record))
    }

    async fn save_snapshot(&self, room: &RoomId, snapshot: &[u8]) -> Result<()> {
        store::check_size(snapshot.len())?;
        if !fs::try_exists(self.record_path(room))
            .await
            .map_err(|e| StoreError::Io(e.to_string()))?
        {
            return Err(StoreError::NotFound(room.clone()));
        }
        write_atomic(&self.snapshot_path(room), snapshot).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use collab_core::MAX_SNAPSHOT_BYTES;
    use tempfile::TempDir;

    fn store() -> (TempDir, FileStore) {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        (dir, store)
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let (_dir, store) = store();
        let room = RoomId::template("7").unwrap();
        let record = EntityRecord::new(&room)
            .with_title("Weekly")
            .with_content("<p>Goals</p>")
            .with_editors(["alice"]);
        store.put_entity(&record).await.unwrap();

        let loaded = store.fetch(&room).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.fetch(&RoomId::template("8").unwrap()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_snapshot_layout_and_replace() {
        let (dir, store) = store();
        let room = RoomId::note("42").unwrap();
        store.put_entity(&EntityRecord::new(&room)).await.unwrap();

        store.save_snapshot(&room, b"one").await.unwrap();
        store.save_snapshot(&room, b"two").await.unwrap();

        let on_disk = std::fs::read(dir.path().join("notes").join("42.loro")).unwrap();
        assert_eq!(on_disk, b"two");
        assert!(!dir.path().join("notes").join("42.loro.tmp").exists());

        let loaded = store.fetch(&room).await.unwrap().unwrap();
        assert_eq!(loaded.snapshot.as_deref(), Some(&b"two"[..]));
    }

    #[tokio::test]
    async fn test_save_rejects_unknown_and_oversized() {
        let (_dir, store) = store();
        let room = RoomId::note("1").unwrap();

        let err = store.save_snapshot(&room, b"x").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        store.put_entity(&EntityRecord::new(&room)).await.unwrap();
        let err = store
            .save_snapshot(&room, &vec![0u8; MAX_SNAPSHOT_BYTES + 1])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::TooLarge { .. }));
    }

    #[tokio::test]
    async fn test_corrupt_record() {
        let (dir, store) = store();
        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes").join("1.json"), "{").unwrap();

        let err = store.fetch(&RoomId::note("1").unwrap()).await.unwrap_err();
        assert!(matches!(err, StoreError::Corrupt(..)));
    }
}
