//! Snapshot gateway: HTTP read and write of persisted document state.
//!
//! - `GET /{notes|templates}/{id}` returns the stored snapshot (base64) with
//!   legacy fallbacks for clients that cannot decode it
//! - `PATCH /{notes|templates}/{id}/sync-state` merges a client snapshot into
//!   the live room, or into the stored snapshot when no room is open
//! - `GET /stats` reports registry counts
//!
//! Writes are serialized per entity by a try-lock; a contended write is
//! rejected with `429` rather than queued.

use crate::AppState;
use axum::{
    Json, Router,
    body::Bytes,
    extract::{DefaultBodyLimit, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use collab_core::legacy;
use collab_core::store::{self, MAX_SNAPSHOT_BYTES};
use collab_core::{CollabDocument, DocumentError, EntityKind, EntityRecord, RoomId, StoreError};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Header carrying the authenticated caller's user ID.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Request body limit: a maximal snapshot in base64 plus room for the JSON around it.
pub const MAX_BODY_BYTES: usize = MAX_SNAPSHOT_BYTES.div_ceil(3) * 4 + 64 * 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Not found")]
    NotFound,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Snapshot too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },

    #[error("Entity is being written by another request")]
    Locked,

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

impl From<StoreError> for GatewayError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::TooLarge { size, limit } => Self::TooLarge { size, limit },
            StoreError::NotFound(_) => Self::NotFound,
            other => Self::Store(other),
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Locked => StatusCode::TOO_MANY_REQUESTS,
            Self::Store(_) | Self::Document(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!("Gateway error: {}", self);
        }
        (
            status,
            Json(ErrorBody {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Response of `GET /{collection}/{id}`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct EntitySnapshot {
    pub id: String,
    pub kind: EntityKind,
    pub title: Option<String>,
    /// Base64-encoded full document state
    pub snapshot: Option<String>,
    /// Set to `"corrupted"` when the stored snapshot cannot be decoded
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_error: Option<String>,
    /// Legacy HTML content
    pub fallback_content: Option<String>,
    /// Plain text of the legacy content
    pub fallback_plain_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SyncStateBody {
    snapshot: Option<String>,
}

/// Response of a successful `PATCH /{collection}/{id}/sync-state`.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct WriteOutcome {
    pub ok: bool,
    /// Whether the snapshot was merged into existing state (as opposed to
    /// becoming the stored state outright)
    pub merged: bool,
    /// Size of the state now stored
    pub size: usize,
}

#[derive(Debug, Serialize)]
struct StatsBody {
    rooms: usize,
    connections: usize,
    seeds: usize,
}

pub fn router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/stats", get(stats_handler))
        .route("/{collection}/{id}", get(get_handler))
        .route("/{collection}/{id}/sync-state", patch(patch_handler))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}

fn resolve(collection: &str, id: &str) -> Result<RoomId, GatewayError> {
    let kind = EntityKind::from_collection(collection).ok_or(GatewayError::NotFound)?;
    RoomId::new(kind, id).map_err(|_| GatewayError::NotFound)
}

fn caller(headers: &HeaderMap) -> Option<&str> {
    headers.get(USER_ID_HEADER).and_then(|v| v.to_str().ok())
}

async fn stats_handler(State(app): State<Arc<AppState>>) -> Json<StatsBody> {
    let stats = app.registry.stats().await;
    Json(StatsBody {
        rooms: stats.rooms,
        connections: stats.connections,
        seeds: app.seeder.seed_count(),
    })
}

async fn get_handler(
    State(app): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<EntitySnapshot>, GatewayError> {
    let room = resolve(&collection, &id)?;
    read_snapshot(&app, &room, caller(&headers)).await.map(Json)
}

async fn patch_handler(
    State(app): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WriteOutcome>, GatewayError> {
    let room = resolve(&collection, &id)?;
    write_snapshot(&app, &room, caller(&headers), &body)
        .await
        .map(Json)
}

async fn fetch_accessible(
    app: &AppState,
    room: &RoomId,
    caller: Option<&str>,
) -> Result<EntityRecord, GatewayError> {
    match app.store().fetch(room).await? {
        Some(record) if record.can_write(caller) => Ok(record),
        Some(_) => {
            debug!("{:?} may not access {}", caller, room);
            Err(GatewayError::NotFound)
        }
        None => Err(GatewayError::NotFound),
    }
}

/// Load an entity's stored snapshot and legacy fallbacks.
pub async fn read_snapshot(
    app: &AppState,
    room: &RoomId,
    caller: Option<&str>,
) -> Result<EntitySnapshot, GatewayError> {
    let record = fetch_accessible(app, room, caller).await?;

    let (snapshot, snapshot_error) = match record.snapshot.as_deref() {
        Some(bytes) => match CollabDocument::from_snapshot(room.kind(), bytes) {
            Ok(_) => (Some(STANDARD.encode(bytes)), None),
            Err(e) => {
                warn!("Stored snapshot for {} is corrupted: {}", room, e);
                (None, Some("corrupted".to_string()))
            }
        },
        None => (None, None),
    };

    let fallback_plain_text = record.content.as_deref().map(legacy::html_to_plain_text);
    Ok(EntitySnapshot {
        id: record.id,
        kind: record.kind,
        title: record.title,
        snapshot,
        snapshot_error,
        fallback_content: record.content,
        fallback_plain_text,
    })
}

/// Merge a client snapshot (`{"snapshot": base64}`) into the entity's state.
pub async fn write_snapshot(
    app: &AppState,
    room: &RoomId,
    caller: Option<&str>,
    body: &[u8],
) -> Result<WriteOutcome, GatewayError> {
    let body: SyncStateBody = serde_json::from_slice(body)
        .map_err(|e| GatewayError::BadRequest(format!("invalid JSON body: {}", e)))?;
    let encoded = body
        .snapshot
        .ok_or_else(|| GatewayError::BadRequest("missing snapshot".to_string()))?;
    let incoming = STANDARD
        .decode(encoded.as_bytes())
        .map_err(|e| GatewayError::BadRequest(format!("snapshot is not base64: {}", e)))?;
    store::check_size(incoming.len())?;
    CollabDocument::from_snapshot(room.kind(), &incoming)
        .map_err(|e| GatewayError::BadRequest(format!("snapshot is not a document: {}", e)))?;

    fetch_accessible(app, room, caller).await?;
    let _guard = app.locks().try_acquire(room).ok_or(GatewayError::Locked)?;

    let outcome = match app.registry.get(room).await {
        Some(live) => {
            app.seeder.ensure_seeded(&live).await;
            app.registry.merge_stored(&live).await?;

            let mut trial = CollabDocument::from_snapshot(room.kind(), &live.encode_full_state().await?)?;
            trial.apply_update(&incoming)?;
            store::check_size(trial.encode_full_state()?.len())?;

            live.apply_update(&incoming, None).await?;
            let state = live.encode_full_state().await?;
            app.store().save_snapshot(room, &state).await?;
            WriteOutcome {
                ok: true,
                merged: true,
                size: state.len(),
            }
        }
        None => {
            let record = app
                .store()
                .fetch(room)
                .await?
                .ok_or(GatewayError::NotFound)?;
            let existing = record.snapshot.as_deref().and_then(|bytes| {
                CollabDocument::from_snapshot(room.kind(), bytes)
                    .inspect_err(|e| warn!("Overwriting corrupted snapshot for {}: {}", room, e))
                    .ok()
            });

            let (state, merged) = match existing {
                Some(mut doc) => {
                    doc.apply_update(&incoming)?;
                    (doc.encode_full_state()?, true)
                }
                None => (incoming, false),
            };
            store::check_size(state.len())?;
            app.store().save_snapshot(room, &state).await?;
            WriteOutcome {
                ok: true,
                merged,
                size: state.len(),
            }
        }
    };

    info!(
        "Stored snapshot for {} ({} bytes, merged: {})",
        room, outcome.size, outcome.merged
    );
    Ok(outcome)
}
