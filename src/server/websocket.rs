//! WebSocket session management for replica connections.
//!
//! Each connection opens a replica with the engine, waits for its snapshot
//! to be queued, forwards its outbound queue to the socket from a dedicated
//! task and feeds inbound text frames to the engine.

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::protocol::ServerMessage;
use crate::server::routes::AppState;
use crate::sync::ReplicaId;

/// WebSocket session for one replica
pub struct WebSocketSession {
    engine: AppState,
    replica_id: ReplicaId,
}

impl WebSocketSession {
    /// Create a session for a replica the engine has opened but not synced
    pub fn new(engine: AppState, replica_id: ReplicaId) -> Self {
        Self { engine, replica_id }
    }

    /// Sync the replica, then drive the connection until the client leaves
    /// or falls behind
    pub async fn run(self, socket: WebSocket) {
        let outbox = match self.engine.sync_replica(self.replica_id).await {
            Ok(replica) => replica.into_parts().1,
            Err(e) => {
                warn!("Replica {} could not be synced: {}", self.replica_id, e);
                return;
            }
        };
        info!("WebSocket session for replica {} established", self.replica_id);

        let (sink, mut stream) = socket.split();
        let mut writer = spawn_writer(self.replica_id, sink, outbox);

        loop {
            tokio::select! {
                _ = &mut writer => {
                    debug!("Outbound stream for replica {} ended", self.replica_id);
                    break;
                }
                msg = stream.next() => match msg {
                    Some(Ok(Message::Text(text))) => self.handle_text_message(text).await,
                    Some(Ok(Message::Close(_))) | None => {
                        info!("Replica {} closed the connection", self.replica_id);
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        let error = ProtocolError::Malformed(format!(
                            "expected a JSON text frame, got {} binary bytes",
                            data.len()
                        ));
                        self.engine.reject(self.replica_id, &error);
                    }
                    // Pings are answered by the transport
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error for replica {}: {}", self.replica_id, e);
                        break;
                    }
                }
            }
        }

        self.engine.disconnect(self.replica_id);
        writer.abort();
        info!("Session for replica {} ended", self.replica_id);
    }

    async fn handle_text_message(&self, text: String) {
        debug!("Replica {} sent: {}", self.replica_id, text);

        let engine = Arc::clone(&self.engine);
        let replica_id = self.replica_id;
        // Spawned so a mutation runs to completion even if this session is dropped.
        let task = tokio::spawn(async move { engine.handle(replica_id, &text).await });

        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Message from replica {} not applied: {}", replica_id, e),
            Err(e) => error!("Handler for replica {} failed: {}", replica_id, e),
        }
    }
}

fn spawn_writer(
    replica_id: ReplicaId,
    mut sink: SplitSink<WebSocket, Message>,
    mut outbox: mpsc::Receiver<ServerMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = outbox.recv().await {
            let json = match message.to_json() {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to encode message for replica {}: {}", replica_id, e);
                    continue;
                }
            };
            if sink.send(Message::Text(json)).await.is_err() {
                debug!("Socket for replica {} is gone", replica_id);
                break;
            }
        }
        let _ = sink.close().await;
    })
}

/// Open a replica for the socket and run its session
pub async fn handle_websocket_connection(socket: WebSocket, engine: AppState) {
    let replica_id = engine.open_replica();
    let session = WebSocketSession::new(engine, replica_id);
    session.run(socket).await;
}
