//! collab-server library: Exposes internal modules for testing.
//!
//! This is a thin library layer over the server components,
//! allowing integration tests to access internal types.

pub mod config;
pub mod connection;
pub mod gateway;
pub mod locks;
pub mod multiplexer;
pub mod native_store;
pub mod registry;
pub mod seeder;
pub mod session;

use collab_core::EntityStore;
use std::sync::Arc;
use std::time::Duration;

// Re-export key types for convenience
pub use config::{Config, ConnectionConfig};
pub use connection::{ConnectionHandle, ConnectionId, PeerConnection};
pub use locks::{EntityLocks, EntityWriteGuard};
pub use multiplexer::Multiplexer;
pub use native_store::FileStore;
pub use registry::{RegistryStats, Room, RoomLease, RoomRegistry};
pub use seeder::Seeder;

/// State shared by the multiplexer, sessions, and the gateway.
pub struct AppState {
    pub registry: RoomRegistry,
    pub seeder: Seeder,
    pub connections: ConnectionConfig,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EntityStore>,
        idle_grace: Option<Duration>,
        connections: ConnectionConfig,
    ) -> Self {
        Self {
            registry: RoomRegistry::new(Arc::clone(&store), EntityLocks::new(), idle_grace),
            seeder: Seeder::new(store),
            connections,
        }
    }

    pub fn store(&self) -> &Arc<dyn EntityStore> {
        self.registry.store()
    }

    pub fn locks(&self) -> &EntityLocks {
        self.registry.locks()
    }
}
