//! Individual peer connection management.
//!
//! Each connection wraps a WebSocket stream split into read and write halves.
//! The write half is owned by a writer task draining an unbounded queue, so
//! broadcasting to a peer is a non-blocking push that never waits on its socket.

use collab_core::SyncMessage;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::fmt::{self, Display, Formatter};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::{debug, error, warn};

/// Server-assigned connection ID, rendered as `conn-N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Sending side of a connection, held by the room it is attached to.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Message>) -> Self {
        Self { id, tx }
    }

    /// Queue a binary frame. Returns `false` if the connection is gone.
    pub fn send_binary(&self, data: Vec<u8>) -> bool {
        self.tx.send(Message::Binary(data.into())).is_ok()
    }

    /// Queue a sync frame.
    pub fn send_sync(&self, msg: &SyncMessage) -> bool {
        self.send_binary(msg.encode())
    }

    pub fn send_ping(&self) -> bool {
        self.tx.send(Message::Ping(Vec::new().into())).is_ok()
    }

    pub fn close(&self) {
        let _ = self.tx.send(Message::Close(None));
    }
}

/// One inbound event from the peer.
#[derive(Debug)]
pub enum Incoming {
    /// A data frame (binary, or text treated as bytes)
    Frame(Vec<u8>),
    /// A frame over the size limit; dropped
    Oversized(usize),
    /// Ping/pong or other control traffic
    Activity,
    /// Close frame, stream end, or transport error
    Closed,
}

/// A single WebSocket connection to a peer.
pub struct PeerConnection<S> {
    pub id: ConnectionId,
    handle: ConnectionHandle,
    read: SplitStream<WebSocketStream<S>>,
    max_message_size: usize,
    write_task: JoinHandle<()>,
}

impl<S> PeerConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Wrap an upgraded stream and spawn its writer task.
    pub fn new(id: ConnectionId, ws_stream: WebSocketStream<S>, max_message_size: usize) -> Self {
        let (write, read) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(Self::write_loop(id, write, rx));

        Self {
            id,
            handle: ConnectionHandle::new(id, tx),
            read,
            max_message_size,
            write_task,
        }
    }

    /// Writer loop: drains the outbound queue into the socket.
    async fn write_loop(
        id: ConnectionId,
        mut write: SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::UnboundedReceiver<Message>,
    ) {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, Message::Close(_));
            if let Err(e) = write.send(msg).await {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed => {
                        debug!("Write to closed connection {}", id);
                    }
                    _ => warn!("Failed to send to {}: {}", id, e),
                }
                break;
            }
            if closing {
                break;
            }
        }
        let _ = write.close().await;
    }

    pub fn handle(&self) -> ConnectionHandle {
        self.handle.clone()
    }

    /// Wait for the next inbound event.
    pub async fn recv(&mut self) -> Incoming {
        let msg = match self.read.next().await {
            Some(Ok(msg)) => msg,
            Some(Err(e)) => {
                match e {
                    WsError::ConnectionClosed | WsError::AlreadyClosed | WsError::Protocol(_) => {
                        debug!("Connection {} closed: {}", self.id, e);
                    }
                    _ => error!("WebSocket error on {}: {}", self.id, e),
                }
                return Incoming::Closed;
            }
            None => {
                debug!("Connection {} stream ended", self.id);
                return Incoming::Closed;
            }
        };

        let data = match msg {
            Message::Binary(data) => data.to_vec(),
            Message::Text(text) => text.as_bytes().to_vec(),
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => return Incoming::Activity,
            Message::Close(_) => {
                debug!("Received close frame from {}", self.id);
                return Incoming::Closed;
            }
        };

        if data.len() > self.max_message_size {
            warn!(
                "Message from {} exceeds max size ({} > {}), dropping",
                self.id,
                data.len(),
                self.max_message_size
            );
            return Incoming::Oversized(data.len());
        }
        Incoming::Frame(data)
    }

    /// Close the connection gracefully, flushing queued frames first.
    pub async fn close(self) {
        self.handle.close();
        drop(self.handle);
        let _ = self.write_task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId(7).to_string(), "conn-7");
    }

    #[test]
    fn test_handle_reports_dropped_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(ConnectionId(1), tx);
        assert!(handle.send_binary(vec![1]));

        drop(rx);
        assert!(!handle.send_binary(vec![2]));
        assert!(!handle.send_sync(&SyncMessage::Update { data: vec![] }));
    }

    #[tokio::test]
    async fn test_frames_flow_over_duplex() {
        let (server_io, client_io) = tokio::io::duplex(64 * 1024);
        let (server_ws, client_ws) = tokio::join!(
            WebSocketStream::from_raw_socket(
                server_io,
                tokio_tungstenite::tungstenite::protocol::Role::Server,
                None
            ),
            WebSocketStream::from_raw_socket(
                client_io,
                tokio_tungstenite::tungstenite::protocol::Role::Client,
                None
            ),
        );

        let mut conn = PeerConnection::new(ConnectionId(1), server_ws, 8);
        let (mut client_write, mut client_read) = client_ws.split();

        conn.handle().send_binary(vec![9, 9]);
        match client_read.next().await {
            Some(Ok(Message::Binary(data))) => assert_eq!(data.to_vec(), vec![9, 9]),
            other => panic!("Expected binary frame, got {:?}", other),
        }

        client_write
            .send(Message::Binary(vec![1, 2, 3].into()))
            .await
            .unwrap();
        assert!(matches!(conn.recv().await, Incoming::Frame(d) if d == vec![1, 2, 3]));

        client_write
            .send(Message::Binary(vec![0; 9].into()))
            .await
            .unwrap();
        assert!(matches!(conn.recv().await, Incoming::Oversized(9)));

        client_write.send(Message::Close(None)).await.unwrap();
        assert!(matches!(conn.recv().await, Incoming::Closed));
    }
}
