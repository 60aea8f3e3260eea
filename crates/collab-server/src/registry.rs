//! Room registry: process-wide map from room ID to live room.
//!
//! Rooms are created lazily on first access and handed out behind a
//! [`RoomLease`]. When the last lease on a room is dropped an eviction timer
//! starts; if the room is still unused when it fires, its full state is
//! flushed to the store and the room is removed. Taking a new lease bumps the
//! room's epoch, which cancels any pending eviction.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::locks::EntityLocks;
use collab_core::document::{self, CollabDocument};
use collab_core::{DocumentError, EntityStore, RoomId, StoreError, SyncMessage};
use serde::Serialize;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, OnceCell};
use tracing::{debug, info, warn};

/// Document and subscribers of one room, guarded together.
pub struct RoomState {
    pub document: CollabDocument,
    connections: Vec<ConnectionHandle>,
}

impl RoomState {
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Queue `msg` on every connection except `origin`. Returns the number of recipients.
    fn broadcast(&self, msg: &SyncMessage, origin: Option<ConnectionId>) -> usize {
        let data = msg.encode();
        // A failed push means the writer is gone; its session detaches it
        self.connections
            .iter()
            .filter(|conn| Some(conn.id) != origin)
            .filter(|conn| conn.send_binary(data.clone()))
            .count()
    }
}

/// One live collaborative document.
pub struct Room {
    id: RoomId,
    state: Mutex<RoomState>,
    pub(crate) seeded: OnceCell<()>,
    leases: AtomicUsize,
    epoch: AtomicU64,
}

impl Room {
    fn new(id: RoomId) -> Self {
        let document = CollabDocument::new(id.kind());
        Self {
            id,
            state: Mutex::new(RoomState {
                document,
                connections: Vec::new(),
            }),
            seeded: OnceCell::new(),
            leases: AtomicUsize::new(0),
            epoch: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> &RoomId {
        &self.id
    }

    /// Lock the room's document and subscriber set.
    pub async fn lock(&self) -> MutexGuard<'_, RoomState> {
        self.state.lock().await
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.initialized()
    }

    /// Add a connection. Its queue receives the full document state before
    /// it can receive any broadcast.
    pub async fn attach(&self, handle: ConnectionHandle) -> document::Result<()> {
        let mut state = self.state.lock().await;
        let update = state.document.encode_full_state()?;
        handle.send_sync(&SyncMessage::SyncStep2 { update });
        debug!("Attached {} to {}", handle.id, self.id);
        state.connections.push(handle);
        Ok(())
    }

    /// Remove a connection. Returns whether it was attached.
    pub async fn detach(&self, id: ConnectionId) -> bool {
        let mut state = self.state.lock().await;
        let before = state.connections.len();
        state.connections.retain(|conn| conn.id != id);
        before != state.connections.len()
    }

    /// Merge an update and relay whatever it added to every other connection.
    ///
    /// Returns `None` if the update added nothing, otherwise the number of
    /// connections the delta was queued on.
    pub async fn apply_update(
        &self,
        data: &[u8],
        origin: Option<ConnectionId>,
    ) -> document::Result<Option<usize>> {
        let mut state = self.state.lock().await;
        let Some(delta) = state.document.apply_update(data)? else {
            return Ok(None);
        };
        let sent = state.broadcast(&SyncMessage::Update { data: delta }, origin);
        Ok(Some(sent))
    }

    /// Relay an ephemeral message to every other connection.
    pub async fn relay(&self, msg: &SyncMessage, origin: ConnectionId) -> usize {
        self.state.lock().await.broadcast(msg, Some(origin))
    }

    pub async fn encode_full_state(&self) -> document::Result<Vec<u8>> {
        self.state.lock().await.document.encode_full_state()
    }

    pub async fn encode_update_since(&self, version: &[u8]) -> document::Result<Vec<u8>> {
        self.state.lock().await.document.encode_update_since(version)
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connection_count()
    }

    pub fn lease_count(&self) -> usize {
        self.leases.load(Ordering::SeqCst)
    }
}

/// Counts reported by `GET /stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub rooms: usize,
    pub connections: usize,
}

#[derive(Debug, Error)]
enum FlushError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

struct Inner {
    rooms: Mutex<HashMap<RoomId, Arc<Room>>>,
    store: Arc<dyn EntityStore>,
    locks: EntityLocks,
    idle_grace: Option<Duration>,
}

/// Shared handle to the room map.
#[derive(Clone)]
pub struct RoomRegistry {
    inner: Arc<Inner>,
}

impl RoomRegistry {
    /// `idle_grace: None` keeps rooms for the lifetime of the process.
    pub fn new(store: Arc<dyn EntityStore>, locks: EntityLocks, idle_grace: Option<Duration>) -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms: Mutex::new(HashMap::new()),
                store,
                locks,
                idle_grace,
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        &self.inner.store
    }

    pub fn locks(&self) -> &EntityLocks {
        &self.inner.locks
    }

    /// Find or create the room for `id` and take a lease on it.
    pub async fn get_or_create(&self, id: &RoomId) -> RoomLease {
        let mut rooms = self.inner.rooms.lock().await;
        let room = rooms
            .entry(id.clone())
            .or_insert_with(|| {
                debug!("Creating room {}", id);
                Arc::new(Room::new(id.clone()))
            })
            .clone();
        room.leases.fetch_add(1, Ordering::SeqCst);
        room.epoch.fetch_add(1, Ordering::SeqCst);
        RoomLease {
            room,
            registry: self.clone(),
        }
    }

    /// Look up a live room without creating it.
    pub async fn get(&self, id: &RoomId) -> Option<Arc<Room>> {
        self.inner.rooms.lock().await.get(id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.inner.rooms.lock().await.len()
    }

    pub async fn stats(&self) -> RegistryStats {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.lock().await.values().cloned().collect();
        let mut connections = 0;
        for room in &rooms {
            connections += room.connection_count().await;
        }
        RegistryStats {
            rooms: rooms.len(),
            connections,
        }
    }

    /// Save the state of every live, non-empty room. Returns how many were saved.
    ///
    /// Used on shutdown; rooms stay registered.
    pub async fn flush_all(&self) -> usize {
        let rooms: Vec<Arc<Room>> = self.inner.rooms.lock().await.values().cloned().collect();
        let mut saved = 0;
        for room in rooms {
            let Some(_guard) = self.inner.locks.try_acquire(room.id()) else {
                warn!("{} is locked by a writer, not flushing", room.id());
                continue;
            };
            match self.flush_room(&room).await {
                Ok(true) => saved += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to flush {}: {}", room.id(), e),
            }
        }
        saved
    }

    /// Merge the stored snapshot into `room`, relaying whatever it adds to the
    /// room's connections.
    ///
    /// A write can reach the store after the room was seeded from an older
    /// record; saving the room without this step would overwrite it. Callers
    /// hold the entity write lock.
    pub async fn merge_stored(&self, room: &Room) -> Result<(), StoreError> {
        let Some(snapshot) = self
            .inner
            .store
            .fetch(room.id())
            .await?
            .and_then(|record| record.snapshot)
        else {
            return Ok(());
        };
        match room.apply_update(&snapshot, None).await {
            Ok(Some(sent)) => debug!("Merged stored state into {} ({} recipients)", room.id(), sent),
            Ok(None) => {}
            Err(e) => warn!("Stored snapshot for {} is corrupted, replacing it: {}", room.id(), e),
        }
        Ok(())
    }

    /// Save `room`'s full state on top of what is stored. Returns whether
    /// anything was saved; empty documents are skipped. Callers hold the
    /// entity write lock.
    async fn flush_room(&self, room: &Room) -> Result<bool, FlushError> {
        if room.lock().await.document.is_empty() {
            return Ok(false);
        }
        self.merge_stored(room).await?;
        let bytes = room.encode_full_state().await?;
        self.inner.store.save_snapshot(room.id(), &bytes).await?;
        debug!("Flushed {} ({} bytes)", room.id(), bytes.len());
        Ok(true)
    }

    fn release(&self, room: &Arc<Room>) {
        let remaining = room.leases.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining > 0 {
            return;
        }
        let Some(grace) = self.inner.idle_grace else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let epoch = room.epoch.load(Ordering::SeqCst);
        runtime.spawn(self.clone().evict_when_idle(Arc::clone(room), epoch, grace));
    }

    fn still_idle(room: &Room, epoch: u64) -> bool {
        room.leases.load(Ordering::SeqCst) == 0 && room.epoch.load(Ordering::SeqCst) == epoch
    }

    /// Flush and remove `room` if nobody leases it for a full grace period.
    async fn evict_when_idle(self, room: Arc<Room>, epoch: u64, grace: Duration) {
        loop {
            tokio::time::sleep(grace).await;
            if !Self::still_idle(&room, epoch) {
                return;
            }

            // Held through removal so a gateway write can't land in between
            let Some(_guard) = self.inner.locks.try_acquire(room.id()) else {
                debug!("{} is locked by a writer, retrying eviction", room.id());
                continue;
            };

            match self.flush_room(&room).await {
                Ok(_) => {}
                Err(FlushError::Store(StoreError::NotFound(_))) => {
                    warn!("No stored entity for {}, discarding its state", room.id());
                }
                Err(e @ (FlushError::Store(StoreError::TooLarge { .. }) | FlushError::Document(_))) => {
                    warn!("Cannot flush {}, keeping it in memory: {}", room.id(), e);
                    return;
                }
                Err(e) => {
                    warn!("Failed to flush {}, retrying: {}", room.id(), e);
                    continue;
                }
            }

            let mut rooms = self.inner.rooms.lock().await;
            let current = rooms.get(room.id()).is_some_and(|r| Arc::ptr_eq(r, &room));
            if current && Self::still_idle(&room, epoch) {
                rooms.remove(room.id());
                info!("Evicted idle room {}", room.id());
            }
            return;
        }
    }
}

/// A claim on a room that keeps it from being evicted.
pub struct RoomLease {
    room: Arc<Room>,
    registry: RoomRegistry,
}

impl RoomLease {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }
}

impl Deref for RoomLease {
    type Target = Room;

    fn deref(&self) -> &Room {
        &self.room
    }
}

impl Drop for RoomLease {
    fn drop(&mut self) {
        self.registry.release(&self.room);
    }
}
