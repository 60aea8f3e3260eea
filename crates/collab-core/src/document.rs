//! CollabDocument: Loro document wrapper for one note or template.
//!
//! Each document holds two named root containers:
//! - `content`: LoroTree of blocks. Every node's metadata map carries a
//!   `type` (e.g. `paragraph`), an optional heading `level`, and a `text`
//!   LoroText.
//! - `title`: LoroText for notes; a LoroTree of blocks for templates, so
//!   template titles can carry formatting.
//!
//! Emptiness is structural (no content nodes, empty title). Nothing else in
//! the document records whether it has been seeded.

use crate::legacy::{Block, BlockKind};
use crate::room_id::EntityKind;
use loro::{
    Container, ExportMode, LoroDoc, LoroMap, LoroText, LoroTree, LoroValue, TreeID, TreeParentId,
    ValueOrContainer, VersionVector,
};
use thiserror::Error;

const CONTENT: &str = "content";
const TITLE: &str = "title";

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("Loro error: {0}")]
    Loro(String),

    #[error("Invalid version vector: {0}")]
    InvalidVersion(String),

    #[error("Export error: {0}")]
    Export(String),
}

pub type Result<T> = std::result::Result<T, DocumentError>;

fn loro_err(e: impl std::fmt::Display) -> DocumentError {
    DocumentError::Loro(e.to_string())
}

/// A single collaboratively edited document.
pub struct CollabDocument {
    doc: LoroDoc,
    kind: EntityKind,
}

impl CollabDocument {
    /// Create a new, structurally empty document.
    pub fn new(kind: EntityKind) -> Self {
        let doc = LoroDoc::new();
        doc.get_tree(CONTENT).enable_fractional_index(0);
        if kind == EntityKind::Template {
            doc.get_tree(TITLE).enable_fractional_index(0);
        }
        Self { doc, kind }
    }

    /// Create a document from an encoded full state (or any update blob).
    pub fn from_snapshot(kind: EntityKind, bytes: &[u8]) -> Result<Self> {
        let mut document = Self::new(kind);
        document.apply_update(bytes)?;
        Ok(document)
    }

    pub fn kind(&self) -> EntityKind {
        self.kind
    }

    /// The content tree container.
    pub fn content(&self) -> LoroTree {
        self.doc.get_tree(CONTENT)
    }

    /// True when every named substructure has zero length.
    pub fn is_empty(&self) -> bool {
        let title_empty = match self.kind {
            EntityKind::Note => self.doc.get_text(TITLE).len_unicode() == 0,
            EntityKind::Template => self.doc.get_tree(TITLE).roots().is_empty(),
        };
        title_empty && self.content().roots().is_empty()
    }

    /// Merge an update (or snapshot) into the document.
    ///
    /// Returns the delta the merge added, encoded as an update relative to the
    /// version before the merge, or `None` if nothing new was applied
    /// (duplicate delivery, or updates still waiting on missing dependencies).
    pub fn apply_update(&mut self, data: &[u8]) -> Result<Option<Vec<u8>>> {
        let before = self.doc.oplog_vv();
        self.doc.import(data).map_err(loro_err)?;
        let after = self.doc.oplog_vv();

        if after == before {
            tracing::trace!("Update contained no new operations");
            return Ok(None);
        }
        self.export(ExportMode::updates(&before)).map(Some)
    }

    /// Export the full current state.
    pub fn encode_full_state(&self) -> Result<Vec<u8>> {
        self.export(ExportMode::Snapshot)
    }

    /// Export everything a peer at `version` (an encoded version vector) is missing.
    pub fn encode_update_since(&self, version: &[u8]) -> Result<Vec<u8>> {
        let from = VersionVector::decode(version)
            .map_err(|e| DocumentError::InvalidVersion(e.to_string()))?;
        self.export(ExportMode::updates(&from))
    }

    /// Current version vector, encoded.
    pub fn version(&self) -> Vec<u8> {
        self.doc.oplog_vv().encode()
    }

    /// Current version vector. Compare these rather than [`version`](Self::version)
    /// bytes, whose entry order is unspecified.
    pub fn version_vector(&self) -> VersionVector {
        self.doc.oplog_vv()
    }

    /// Deep value of the whole document, for comparisons.
    pub fn deep_value(&self) -> LoroValue {
        self.doc.get_deep_value()
    }

    fn export(&self, mode: ExportMode<'_>) -> Result<Vec<u8>> {
        self.doc
            .export(mode)
            .map_err(|e| DocumentError::Export(e.to_string()))
    }

    /// Append blocks to the end of the content tree.
    pub fn insert_blocks(&mut self, blocks: &[Block]) -> Result<()> {
        let tree = self.content();
        for block in blocks {
            insert_block(&tree, TreeParentId::Root, block)?;
        }
        self.doc.commit();
        Ok(())
    }

    /// Append a single paragraph to the content tree.
    pub fn append_paragraph(&mut self, text: &str) -> Result<()> {
        self.insert_blocks(&[Block::paragraph(text)])
    }

    /// Read the content tree back as blocks.
    pub fn blocks(&self) -> Vec<Block> {
        read_blocks(&self.content(), self.content().roots())
    }

    /// Replace the title.
    ///
    /// For templates the title becomes a single paragraph block.
    pub fn set_title(&mut self, title: &str) -> Result<()> {
        match self.kind {
            EntityKind::Note => {
                let text = self.doc.get_text(TITLE);
                let len = text.len_unicode();
                if len > 0 {
                    text.delete(0, len).map_err(loro_err)?;
                }
                text.insert(0, title).map_err(loro_err)?;
            }
            EntityKind::Template => {
                let tree = self.doc.get_tree(TITLE);
                for root in tree.roots() {
                    tree.delete(root).map_err(loro_err)?;
                }
                insert_block(&tree, TreeParentId::Root, &Block::paragraph(title))?;
            }
        }
        self.doc.commit();
        Ok(())
    }

    /// Title as plain text.
    pub fn title(&self) -> String {
        match self.kind {
            EntityKind::Note => self.doc.get_text(TITLE).to_string(),
            EntityKind::Template => {
                let tree = self.doc.get_tree(TITLE);
                read_blocks(&tree, tree.roots())
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .join("\n")
            }
        }
    }
}

fn insert_block(tree: &LoroTree, parent: TreeParentId, block: &Block) -> Result<TreeID> {
    let node_id = tree.create(parent).map_err(loro_err)?;
    let meta = tree.get_meta(node_id).map_err(loro_err)?;

    meta.insert("type", block.kind.type_name()).map_err(loro_err)?;
    if let BlockKind::Heading(level) = block.kind {
        meta.insert("level", level as i64).map_err(loro_err)?;
    }
    let text = meta
        .insert_container("text", LoroText::new())
        .map_err(loro_err)?;
    if !block.text.is_empty() {
        text.insert(0, &block.text).map_err(loro_err)?;
    }

    for child in &block.children {
        insert_block(tree, TreeParentId::Node(node_id), child)?;
    }
    Ok(node_id)
}

fn read_blocks(tree: &LoroTree, nodes: Vec<TreeID>) -> Vec<Block> {
    nodes
        .into_iter()
        .filter(|id| !tree.is_node_deleted(id).unwrap_or(true))
        .filter_map(|id| read_block(tree, id))
        .collect()
}

fn read_block(tree: &LoroTree, node_id: TreeID) -> Option<Block> {
    let meta = tree.get_meta(node_id).ok()?;

    let type_name = meta_string(&meta, "type").unwrap_or_default();
    let level = match meta.get("level") {
        Some(ValueOrContainer::Value(LoroValue::I64(n))) => u8::try_from(n).ok(),
        _ => None,
    };
    let text = match meta.get("text") {
        Some(ValueOrContainer::Container(Container::Text(t))) => t.to_string(),
        Some(ValueOrContainer::Value(LoroValue::String(s))) => s.to_string(),
        _ => String::new(),
    };
    let children = read_blocks(tree, tree.children(&node_id).unwrap_or_default());

    Some(Block {
        kind: BlockKind::from_type_name(&type_name, level),
        text,
        children,
    })
}

fn meta_string(meta: &LoroMap, key: &str) -> Option<String> {
    match meta.get(key) {
        Some(ValueOrContainer::Value(LoroValue::String(s))) => Some(s.to_string()),
        _ => None,
    }
}
