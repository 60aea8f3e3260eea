//! One-time initialization of a room's document.
//!
//! The first access to a room seeds it from the store: the stored snapshot if
//! there is one, otherwise the entity's legacy HTML content and title. Kind
//! defaults fill in whatever the legacy record lacks. Seeding is skipped for a
//! document that already has content, and it never fails the connection that
//! triggered it: problems are logged and the room carries on with whatever
//! was applied.

use crate::registry::Room;
use collab_core::document::{self, CollabDocument};
use collab_core::legacy::{self, Block};
use collab_core::{EntityKind, EntityRecord, EntityStore};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Title given to templates that have none.
pub const DEFAULT_TEMPLATE_TITLE: &str = "Untitled Template";

pub struct Seeder {
    store: Arc<dyn EntityStore>,
    seed_count: AtomicUsize,
}

impl Seeder {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self {
            store,
            seed_count: AtomicUsize::new(0),
        }
    }

    /// Number of rooms this seeder has populated from the store.
    pub fn seed_count(&self) -> usize {
        self.seed_count.load(Ordering::SeqCst)
    }

    /// Seed `room` unless it already was. Concurrent callers wait for the
    /// single in-flight seed.
    pub async fn ensure_seeded(&self, room: &Room) {
        room.seeded.get_or_init(|| self.seed(room)).await;
    }

    async fn seed(&self, room: &Room) {
        if !room.lock().await.document.is_empty() {
            debug!("{} already has content, skipping seed", room.id());
            return;
        }

        let record = match self.store.fetch(room.id()).await {
            Ok(record) => record,
            Err(e) => {
                warn!("Failed to load {} for seeding: {}", room.id(), e);
                return;
            }
        };

        let mut state = room.lock().await;
        let doc = &mut state.document;
        if !doc.is_empty() {
            debug!("{} gained content while loading, skipping seed", room.id());
            return;
        }

        if let Some(snapshot) = record.as_ref().and_then(|r| r.snapshot.as_deref()) {
            match doc.apply_update(snapshot) {
                Ok(_) => debug!("Loaded stored snapshot for {}", room.id()),
                Err(e) => warn!("Stored snapshot for {} is corrupted: {}", room.id(), e),
            }
        }

        if doc.is_empty() {
            if let Err(e) = apply_legacy(doc, record.as_ref()) {
                warn!("Failed to apply legacy content to {}: {}", room.id(), e);
            }
        }

        self.seed_count.fetch_add(1, Ordering::SeqCst);
        info!("Seeded {}", room.id());
    }
}

/// Translate a legacy record into document content and apply kind defaults.
fn apply_legacy(doc: &mut CollabDocument, record: Option<&EntityRecord>) -> document::Result<()> {
    let mut blocks = match record.and_then(|r| r.content.as_deref()) {
        Some(html) => legacy_blocks(html),
        None => Vec::new(),
    };
    if blocks.is_empty() && doc.kind() == EntityKind::Template {
        blocks.push(Block::paragraph(""));
    }
    if !blocks.is_empty() {
        doc.insert_blocks(&blocks)?;
    }

    let title = record
        .and_then(|r| r.title.as_deref())
        .filter(|t| !t.is_empty());
    match (doc.kind(), title) {
        (_, Some(title)) => doc.set_title(title)?,
        (EntityKind::Template, None) => doc.set_title(DEFAULT_TEMPLATE_TITLE)?,
        (EntityKind::Note, None) => {}
    }
    Ok(())
}

fn legacy_blocks(html: &str) -> Vec<Block> {
    match legacy::parse_html(html) {
        Ok(blocks) => blocks,
        Err(e) => {
            warn!("Legacy HTML could not be translated, importing as plain text: {}", e);
            legacy::html_to_plain_text(html)
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(Block::paragraph)
                .collect()
        }
    }
}
