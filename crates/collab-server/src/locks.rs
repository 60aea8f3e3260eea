//! Per-entity write locks.
//!
//! A lock is a non-blocking try-lock keyed by room ID. Holding the returned
//! guard is holding the lock; dropping it (including during unwinding)
//! releases it. Locks live in process memory only.

use collab_core::RoomId;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Default)]
pub struct EntityLocks {
    held: Arc<Mutex<HashSet<RoomId>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the write lock for `room`, or `None` if it is already held.
    pub fn try_acquire(&self, room: &RoomId) -> Option<EntityWriteGuard> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(room.clone()) {
            return None;
        }
        Some(EntityWriteGuard {
            locks: self.clone(),
            room: room.clone(),
        })
    }

    pub fn is_held(&self, room: &RoomId) -> bool {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.contains(room)
    }
}

/// Releases the entity lock on drop.
#[derive(Debug)]
pub struct EntityWriteGuard {
    locks: EntityLocks,
    room: RoomId,
}

impl Drop for EntityWriteGuard {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.room);
    }
}
