//! WebSocket front-end over the collaboration engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!            ├── connection handlers ── CollabEngine ── per-doc workers
//! Client B ──┘         │                    │                │
//!                      │                    │                ├── OperationLog
//!                      │                    │                ├── LockManager
//!                      │                    │                └── Roster
//!                      │                    └── SnapshotStore (RocksDB / memory)
//!                      └── event streams fanned back to each socket
//! ```
//!
//! Each connection is one tokio task: it authenticates the first `Join`
//! request through the identity collaborator, bridges subsequent requests
//! into engine calls, and forwards the session's event stream back over
//! the socket. A connection that drops mid-session just leaves — the
//! participant's operations stay valid for idempotent resubmission.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;

use crate::engine::{CollabEngine, EngineConfig, EngineError, SessionHandle, SubmitStatus};
use crate::protocol::{ClientRequest, ServerMessage, SubmitReply};
use crate::session::IdentityProvider;
use crate::storage::{DocumentStore, MemoryStore, SnapshotStore, StoreConfig, StoreError};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: String,
    /// Persistence path (None = in-memory only).
    pub storage_path: Option<PathBuf>,
    /// Engine knobs passed through to the workers.
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            storage_path: None,
            engine: EngineConfig::default(),
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    pub ops_appended: u64,
    pub conflicts_raised: u64,
    pub active_documents: usize,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    engine: Arc<CollabEngine>,
    identity: Arc<dyn IdentityProvider>,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    /// Create a server, opening persistent storage if configured.
    pub fn new(
        config: ServerConfig,
        identity: Arc<dyn IdentityProvider>,
    ) -> Result<Self, StoreError> {
        let store: Arc<dyn SnapshotStore> = match &config.storage_path {
            Some(path) => {
                let store_config = StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                };
                Arc::new(DocumentStore::open(store_config)?)
            }
            None => Arc::new(MemoryStore::new()),
        };

        let engine = Arc::new(CollabEngine::new(config.engine.clone(), store));
        Ok(Self {
            config,
            engine,
            identity,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        })
    }

    /// In-memory server with default configuration.
    pub fn with_defaults(identity: Arc<dyn IdentityProvider>) -> Self {
        // MemoryStore construction cannot fail.
        match Self::new(ServerConfig::default(), identity) {
            Ok(server) => server,
            Err(e) => unreachable!("in-memory server construction failed: {e}"),
        }
    }

    /// Accept connections forever. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        info!("sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            debug!("new TCP connection from {addr}");

            let engine = self.engine.clone();
            let identity = self.identity.clone();
            let stats = self.stats.clone();

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, engine, identity, stats).await {
                    warn!("connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Current statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_documents = self.engine.active_documents().await;
        stats
    }

    /// The engine behind this server (tests drive it directly).
    pub fn engine(&self) -> &Arc<CollabEngine> {
        &self.engine
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

/// Drive one WebSocket connection to completion.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    engine: Arc<CollabEngine>,
    identity: Arc<dyn IdentityProvider>,
    stats: Arc<RwLock<ServerStats>>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    // Session state for this connection, established by the first Join.
    let mut session: Option<SessionHandle> = None;
    let mut events: Option<crate::broadcast::EventStream> = None;

    loop {
        tokio::select! {
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let bytes: Vec<u8> = data.into();
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                            s.total_bytes += bytes.len() as u64;
                        }

                        let request = match ClientRequest::decode(&bytes) {
                            Ok(request) => request,
                            Err(e) => {
                                warn!("undecodable request from {addr}: {e}");
                                continue;
                            }
                        };

                        match request {
                            ClientRequest::Join { token, doc_id } => {
                                let participant = match identity.resolve_participant(&token) {
                                    Ok(participant) => participant,
                                    Err(e) => {
                                        send(&mut ws_sender, &ServerMessage::Error {
                                            message: e.to_string(),
                                        }).await?;
                                        continue;
                                    }
                                };

                                match engine.join(doc_id, participant.clone()).await {
                                    Ok((handle, state, stream)) => {
                                        info!(
                                            "participant {} ({}) joined doc {doc_id} from {addr}",
                                            participant.display_name, participant.id
                                        );
                                        session = Some(handle);
                                        events = Some(stream);
                                        send(&mut ws_sender, &ServerMessage::Joined {
                                            participant,
                                            position: state.position,
                                            text: state.text,
                                            locks: state.locks,
                                            presence: state.presence,
                                        }).await?;
                                    }
                                    Err(e) => {
                                        send(&mut ws_sender, &ServerMessage::Error {
                                            message: e.to_string(),
                                        }).await?;
                                    }
                                }
                            }

                            ClientRequest::Submit { op } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                let client_op_id = op.client_op_id;
                                let reply = match engine.submit(handle, op).await {
                                    Ok(SubmitStatus::Appended(position)) => {
                                        stats.write().await.ops_appended += 1;
                                        SubmitReply::Appended { position }
                                    }
                                    Ok(SubmitStatus::Rejected(record)) => {
                                        stats.write().await.conflicts_raised += 1;
                                        SubmitReply::Rejected { record }
                                    }
                                    Err(EngineError::Backpressured) => SubmitReply::Backpressured,
                                    Err(EngineError::StaleClient { earliest, .. }) => {
                                        SubmitReply::Stale { earliest }
                                    }
                                    Err(e) => {
                                        send(&mut ws_sender, &ServerMessage::Error {
                                            message: e.to_string(),
                                        }).await?;
                                        continue;
                                    }
                                };
                                send(&mut ws_sender, &ServerMessage::SubmitResult {
                                    client_op_id,
                                    reply,
                                }).await?;
                            }

                            ClientRequest::AcquireLock { start, end, ttl_ms } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                let ttl = ttl_ms.map(std::time::Duration::from_millis);
                                let response = match engine
                                    .acquire_lock(handle, start, end, ttl)
                                    .await
                                {
                                    Ok(lock) => ServerMessage::LockGranted { lock },
                                    Err(EngineError::Conflict(existing)) => {
                                        ServerMessage::LockDenied { existing }
                                    }
                                    Err(e) => ServerMessage::Error {
                                        message: e.to_string(),
                                    },
                                };
                                send(&mut ws_sender, &response).await?;
                            }

                            ClientRequest::ReleaseLock { start, end } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                if let Err(e) = engine.release_lock(handle, start, end).await {
                                    send(&mut ws_sender, &ServerMessage::Error {
                                        message: e.to_string(),
                                    }).await?;
                                }
                            }

                            ClientRequest::RenewLock { start, end } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                if let Err(e) = engine.renew_lock(handle, start, end).await {
                                    send(&mut ws_sender, &ServerMessage::Error {
                                        message: e.to_string(),
                                    }).await?;
                                }
                            }

                            ClientRequest::Cursor { cursor } => {
                                if let Some(handle) = session {
                                    engine.update_cursor(handle, cursor).await;
                                }
                            }

                            ClientRequest::Heartbeat => {
                                if let Some(handle) = session {
                                    engine.heartbeat(handle).await;
                                }
                            }

                            ClientRequest::Ack { position } => {
                                if let Some(handle) = session {
                                    engine.ack(handle, position).await;
                                }
                            }

                            ClientRequest::ResolveConflict { conflict_id, accept } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                let response = match engine
                                    .resolve_conflict(handle, conflict_id, accept)
                                    .await
                                {
                                    Ok(applied) => ServerMessage::ConflictResolved {
                                        conflict_id,
                                        applied,
                                    },
                                    Err(e) => ServerMessage::Error {
                                        message: e.to_string(),
                                    },
                                };
                                send(&mut ws_sender, &response).await?;
                            }

                            ClientRequest::CatchUp { since } => {
                                let Some(handle) = session else {
                                    send(&mut ws_sender, &not_joined()).await?;
                                    continue;
                                };
                                let response = match engine.catch_up(handle, since).await {
                                    Ok(entries) => ServerMessage::CaughtUp { entries },
                                    Err(e) => ServerMessage::Error {
                                        message: e.to_string(),
                                    },
                                };
                                send(&mut ws_sender, &response).await?;
                            }
                        }
                    }

                    Some(Ok(Message::Ping(data))) => {
                        ws_sender.send(Message::Pong(data)).await?;
                    }

                    Some(Ok(Message::Close(_))) | None => {
                        debug!("connection closed from {addr}");
                        break;
                    }

                    Some(Err(e)) => {
                        warn!("websocket error from {addr}: {e}");
                        break;
                    }

                    _ => {}
                }
            }

            // Session events fan back over the socket.
            event = async {
                match events.as_mut() {
                    Some(stream) => stream.recv().await,
                    // Not joined yet — wait forever on this arm.
                    None => std::future::pending().await,
                }
            } => {
                match event {
                    Ok(event) => {
                        send(&mut ws_sender, &ServerMessage::Event((*event).clone())).await?;
                    }
                    Err(crate::broadcast::StreamError::Lagged(missed)) => {
                        warn!("subscriber {addr} lagged by {missed} events");
                        send(&mut ws_sender, &ServerMessage::Lagged { missed }).await?;
                    }
                    Err(crate::broadcast::StreamError::Closed) => {
                        // Worker ended; the client reconnects and rejoins.
                        break;
                    }
                }
            }
        }
    }

    if let Some(handle) = session {
        engine.leave(handle).await;
    }

    {
        let mut s = stats.write().await;
        s.active_connections = s.active_connections.saturating_sub(1);
    }

    Ok(())
}

fn not_joined() -> ServerMessage {
    ServerMessage::Error {
        message: crate::protocol::ProtocolError::NotJoined.to_string(),
    }
}

async fn send<S>(sender: &mut S, message: &ServerMessage) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = message.encode()?;
    sender.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
