//! WebSocket multiplexer: accepts connections and routes them to rooms.
//!
//! The upgrade path names the room (`/note-42`, `/template-7`). It is
//! classified once, during the upgrade; anything that is not a room path is
//! answered with `404` and never reaches the registry.

use crate::AppState;
use crate::connection::ConnectionId;
use crate::session;
use anyhow::Result;
use collab_core::{RoomId, RoomRoute};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{debug, error, info};

/// Accepts WebSocket connections and hands each to its own session task.
pub struct Multiplexer {
    app: Arc<AppState>,
    next_conn_id: AtomicU64,
}

impl Multiplexer {
    pub fn new(app: Arc<AppState>) -> Self {
        Self {
            app,
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("WebSocket server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept connections forever. Each connection runs in its own task, so
    /// seeding one room never holds up another.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let mux = Arc::clone(&self);
                    tokio::spawn(async move { mux.accept_connection(stream, addr).await });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }
    }

    /// Upgrade one TCP connection and run its session to completion.
    pub async fn accept_connection(&self, stream: TcpStream, addr: SocketAddr) {
        let mut room: Option<RoomId> = None;
        let classify = |request: &Request, response: Response| {
            match RoomRoute::classify(request.uri().path()).room_id() {
                Some(id) => {
                    room = Some(id);
                    Ok(response)
                }
                None => Err(not_found(request.uri().path())),
            }
        };

        let ws_stream = match accept_hdr_async(stream, classify).await {
            Ok(ws) => ws,
            Err(WsError::Http(response)) => {
                debug!("Rejected upgrade from {} ({})", addr, response.status());
                return;
            }
            Err(e) => {
                // Health checks (like `nc -z`) connect and immediately close without
                // completing the WebSocket handshake. Log these as debug, not error.
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    error!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let Some(room) = room else {
            error!("Upgrade from {} completed without a room", addr);
            return;
        };

        let id = ConnectionId(self.next_conn_id.fetch_add(1, Ordering::SeqCst));
        info!("New connection from {} (conn_id: {}, room: {})", addr, id, room);

        session::serve_connection(Arc::clone(&self.app), ws_stream, room, id).await;
    }
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("No room at {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}
