//! WebSocket sync client.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, rejoin)
//! - Operation submission with a pending queue keyed by client op id —
//!   resubmitted verbatim after a reconnect, which the sequencer
//!   deduplicates, so a retry never double-applies
//! - An authoritative text shadow folded from `OperationApplied` events,
//!   with automatic acks and gap-repair via `CatchUp`
//! - Lock, cursor, heartbeat, and conflict-resolution requests
//!
//! The presentation layer consumes [`ClientEvent`]s from the channel
//! returned by [`SyncClient::take_event_rx`] and renders from there.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::DocEvent;
use crate::locks::LockSummary;
use crate::operation::{apply, Cursor, LogEntry, Operation};
use crate::protocol::{ClientRequest, ProtocolError, ServerMessage, SubmitReply};
use crate::session::Participant;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced to the presentation layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Socket established and join sent.
    Connected,
    /// Join acknowledged; the shadow document is initialized.
    Joined {
        participant: Participant,
        position: u64,
        text: String,
        locks: Vec<LockSummary>,
        presence: Vec<Participant>,
    },
    /// Connection lost; pending operations will be resubmitted on the
    /// next connect.
    Disconnected,
    /// A broadcast session event, already folded into the text shadow
    /// where applicable.
    Remote(DocEvent),
    /// Outcome of one of our submissions.
    SubmitResult {
        client_op_id: Uuid,
        reply: SubmitReply,
    },
    LockGranted {
        lock: LockSummary,
    },
    LockDenied {
        existing: LockSummary,
    },
    ConflictResolved {
        conflict_id: Uuid,
        applied: Option<u64>,
    },
    ServerError(String),
}

/// Unacknowledged operations, kept in submission order for replay.
pub struct PendingOps {
    ops: HashMap<Uuid, Operation>,
    order: VecDeque<Uuid>,
    max_size: usize,
}

impl PendingOps {
    pub fn new(max_size: usize) -> Self {
        Self {
            ops: HashMap::new(),
            order: VecDeque::new(),
            max_size,
        }
    }

    /// Track an operation until the server settles it. False when full.
    pub fn insert(&mut self, op: Operation) -> bool {
        if self.ops.len() >= self.max_size {
            return false;
        }
        self.order.push_back(op.client_op_id);
        self.ops.insert(op.client_op_id, op);
        true
    }

    /// Settle an operation (appended or rejected).
    pub fn settle(&mut self, client_op_id: Uuid) -> Option<Operation> {
        self.order.retain(|id| *id != client_op_id);
        self.ops.remove(&client_op_id)
    }

    /// All pending operations in original submission order.
    pub fn replay(&self) -> Vec<Operation> {
        self.order
            .iter()
            .filter_map(|id| self.ops.get(id).cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Shared shadow of the authoritative document.
#[derive(Debug, Clone, Default)]
struct Shadow {
    /// Next log position we expect (number of entries applied).
    position: u64,
    text: String,
}

/// The sync client.
pub struct SyncClient {
    token: String,
    doc_id: Uuid,
    server_url: String,
    heartbeat_interval: Duration,

    state: Arc<RwLock<ConnectionState>>,
    shadow: Arc<RwLock<Shadow>>,
    participant: Arc<RwLock<Option<Participant>>>,
    pending: Arc<Mutex<PendingOps>>,

    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl SyncClient {
    pub fn new(
        token: impl Into<String>,
        doc_id: Uuid,
        server_url: impl Into<String>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            token: token.into(),
            doc_id,
            server_url: server_url.into(),
            heartbeat_interval: Duration::from_secs(10),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            shadow: Arc::new(RwLock::new(Shadow::default())),
            participant: Arc::new(RwLock::new(None)),
            pending: Arc::new(Mutex::new(PendingOps::new(10_000))),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Override the heartbeat cadence (tests use a short one).
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect, join the document, and replay any pending operations.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(ok) => ok,
            Err(e) => {
                debug!("connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel onto the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        self.outgoing_tx = Some(out_tx.clone());
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer
                    .send(tokio_tungstenite::tungstenite::Message::Binary(data.into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        // Join first; the server refuses anything else until it lands.
        let join = ClientRequest::Join {
            token: self.token.clone(),
            doc_id: self.doc_id,
        };
        out_tx
            .send(join.encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(ClientEvent::Connected).await;

        // Replay unsettled operations with their original client op ids;
        // the sequencer deduplicates anything that actually landed.
        let replay = self.pending.lock().await.replay();
        if !replay.is_empty() {
            info!("replaying {} pending operations", replay.len());
            for op in replay {
                let request = ClientRequest::Submit { op };
                let _ = out_tx.send(request.encode()?).await;
            }
        }

        // Heartbeat task.
        {
            let out_tx = out_tx.clone();
            let state = self.state.clone();
            let interval = self.heartbeat_interval;
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    if *state.read().await != ConnectionState::Connected {
                        break;
                    }
                    let Ok(encoded) = ClientRequest::Heartbeat.encode() else {
                        break;
                    };
                    if out_tx.send(encoded).await.is_err() {
                        break;
                    }
                }
            });
        }

        // Reader task: fold server messages into the shadow, emit events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let shadow = self.shadow.clone();
        let participant = self.participant.clone();
        let pending = self.pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(tokio_tungstenite::tungstenite::Message::Binary(data)) => {
                        let bytes: Vec<u8> = data.into();
                        let message = match ServerMessage::decode(&bytes) {
                            Ok(message) => message,
                            Err(e) => {
                                warn!("undecodable server message: {e}");
                                continue;
                            }
                        };
                        handle_server_message(
                            message,
                            &event_tx,
                            &shadow,
                            &participant,
                            &pending,
                            &out_tx,
                        )
                        .await;
                    }
                    Ok(tokio_tungstenite::tungstenite::Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Submit an operation. Queued for replay until the server settles it;
    /// silently queued (not sent) while disconnected.
    pub async fn submit(&self, op: Operation) -> Result<Uuid, ProtocolError> {
        let client_op_id = op.client_op_id;
        if !self.pending.lock().await.insert(op.clone()) {
            return Err(ProtocolError::ConnectionClosed);
        }

        if *self.state.read().await == ConnectionState::Connected {
            // A send failure just leaves the op queued for the next replay.
            let _ = self.send(&ClientRequest::Submit { op }).await;
        }
        Ok(client_op_id)
    }

    /// Author and submit an insert at the current shadow position.
    pub async fn insert(&self, offset: usize, text: impl Into<String>) -> Result<Uuid, ProtocolError> {
        let (id, base) = self.author_base().await?;
        self.submit(Operation::insert(id, base, offset, text)).await
    }

    /// Author and submit a delete at the current shadow position.
    pub async fn delete(&self, start: usize, end: usize) -> Result<Uuid, ProtocolError> {
        let (id, base) = self.author_base().await?;
        self.submit(Operation::delete(id, base, start, end)).await
    }

    /// Author and submit a replace at the current shadow position.
    pub async fn replace(
        &self,
        start: usize,
        end: usize,
        text: impl Into<String>,
    ) -> Result<Uuid, ProtocolError> {
        let (id, base) = self.author_base().await?;
        self.submit(Operation::replace(id, base, start, end, text))
            .await
    }

    pub async fn acquire_lock(
        &self,
        start: usize,
        end: usize,
        ttl: Option<Duration>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::AcquireLock {
            start,
            end,
            ttl_ms: ttl.map(|t| t.as_millis() as u64),
        })
        .await
    }

    pub async fn release_lock(&self, start: usize, end: usize) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::ReleaseLock { start, end }).await
    }

    pub async fn renew_lock(&self, start: usize, end: usize) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::RenewLock { start, end }).await
    }

    /// Send a cursor update. Lossy by design.
    pub async fn update_cursor(&self, cursor: Cursor) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::Cursor { cursor }).await
    }

    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        accept: bool,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::ResolveConflict {
            conflict_id,
            accept,
        })
        .await
    }

    /// Request replay of entries at or after `since`.
    pub async fn catch_up(&self, since: u64) -> Result<(), ProtocolError> {
        self.send(&ClientRequest::CatchUp { since }).await
    }

    // ── Accessors ────────────────────────────────────────────────────

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Next log position the shadow expects.
    pub async fn position(&self) -> u64 {
        self.shadow.read().await.position
    }

    /// Current authoritative text shadow.
    pub async fn text(&self) -> String {
        self.shadow.read().await.text.clone()
    }

    /// Our participant identity, once joined.
    pub async fn participant(&self) -> Option<Participant> {
        self.participant.read().await.clone()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub fn doc_id(&self) -> Uuid {
        self.doc_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    async fn author_base(&self) -> Result<(Uuid, u64), ProtocolError> {
        let participant = self
            .participant
            .read()
            .await
            .clone()
            .ok_or(ProtocolError::NotJoined)?;
        let base = self.shadow.read().await.position;
        Ok((participant.id, base))
    }

    async fn send(&self, request: &ClientRequest) -> Result<(), ProtocolError> {
        let encoded = request.encode()?;
        match &self.outgoing_tx {
            Some(tx) => tx
                .send(encoded)
                .await
                .map_err(|_| ProtocolError::ConnectionClosed),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

/// Fold one server message into client state and surface an event.
async fn handle_server_message(
    message: ServerMessage,
    event_tx: &mpsc::Sender<ClientEvent>,
    shadow: &Arc<RwLock<Shadow>>,
    participant: &Arc<RwLock<Option<Participant>>>,
    pending: &Arc<Mutex<PendingOps>>,
    out_tx: &mpsc::Sender<Vec<u8>>,
) {
    match message {
        ServerMessage::Joined {
            participant: me,
            position,
            text,
            locks,
            presence,
        } => {
            {
                let mut shadow = shadow.write().await;
                shadow.position = position;
                shadow.text = text.clone();
            }
            *participant.write().await = Some(me.clone());
            let _ = event_tx
                .send(ClientEvent::Joined {
                    participant: me,
                    position,
                    text,
                    locks,
                    presence,
                })
                .await;
        }

        ServerMessage::SubmitResult {
            client_op_id,
            reply,
        } => {
            match reply {
                SubmitReply::Appended { .. } | SubmitReply::Rejected { .. } => {
                    pending.lock().await.settle(client_op_id);
                }
                // Backpressured/Stale stay pending for a later replay.
                _ => {}
            }
            let _ = event_tx
                .send(ClientEvent::SubmitResult {
                    client_op_id,
                    reply,
                })
                .await;
        }

        ServerMessage::Event(event) => {
            if let DocEvent::OperationApplied(entry) = &event {
                apply_entry(shadow, entry, out_tx).await;
            }
            let _ = event_tx.send(ClientEvent::Remote(event)).await;
        }

        ServerMessage::CaughtUp { entries } => {
            for entry in &entries {
                apply_entry(shadow, entry, out_tx).await;
            }
            debug!("caught up {} entries", entries.len());
        }

        ServerMessage::Lagged { missed } => {
            warn!("lagged by {missed} events; requesting catch-up");
            let since = shadow.read().await.position;
            if let Ok(encoded) = (ClientRequest::CatchUp { since }).encode() {
                let _ = out_tx.send(encoded).await;
            }
        }

        ServerMessage::LockGranted { lock } => {
            let _ = event_tx.send(ClientEvent::LockGranted { lock }).await;
        }

        ServerMessage::LockDenied { existing } => {
            let _ = event_tx.send(ClientEvent::LockDenied { existing }).await;
        }

        ServerMessage::ConflictResolved {
            conflict_id,
            applied,
        } => {
            let _ = event_tx
                .send(ClientEvent::ConflictResolved {
                    conflict_id,
                    applied,
                })
                .await;
        }

        ServerMessage::Error { message } => {
            let _ = event_tx.send(ClientEvent::ServerError(message)).await;
        }
    }
}

/// Apply one log entry to the shadow if it is the next expected one, ack
/// it, and repair gaps with a catch-up request.
async fn apply_entry(shadow: &Arc<RwLock<Shadow>>, entry: &LogEntry, out_tx: &mpsc::Sender<Vec<u8>>) {
    let ack_position = {
        let mut shadow = shadow.write().await;
        if entry.position < shadow.position {
            // Already applied (catch-up overlap).
            return;
        }
        if entry.position > shadow.position {
            // Gap: ask for the missing range instead of applying out of
            // order.
            let since = shadow.position;
            drop(shadow);
            debug!("gap at {since}, requesting catch-up");
            if let Ok(encoded) = (ClientRequest::CatchUp { since }).encode() {
                let _ = out_tx.send(encoded).await;
            }
            return;
        }
        shadow.text = apply(&shadow.text, &entry.span);
        shadow.position = entry.position + 1;
        shadow.position
    };

    if let Ok(encoded) = (ClientRequest::Ack {
        position: ack_position,
    })
    .encode()
    {
        let _ = out_tx.send(encoded).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let doc_id = Uuid::new_v4();
        let client = SyncClient::new("token", doc_id, "ws://localhost:9090");
        assert_eq!(client.doc_id(), doc_id);
        assert_eq!(client.server_url(), "ws://localhost:9090");
    }

    #[tokio::test]
    async fn test_initial_state() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert_eq!(
            client.connection_state().await,
            ConnectionState::Disconnected
        );
        assert_eq!(client.position().await, 0);
        assert_eq!(client.text().await, "");
        assert!(client.participant().await.is_none());
        assert_eq!(client.pending_len().await, 0);
    }

    #[tokio::test]
    async fn test_submit_while_disconnected_queues() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        let origin = Uuid::new_v4();

        client
            .submit(Operation::insert(origin, 0, 0, "a"))
            .await
            .unwrap();
        client
            .submit(Operation::insert(origin, 0, 1, "b"))
            .await
            .unwrap();
        assert_eq!(client.pending_len().await, 2);
    }

    #[tokio::test]
    async fn test_authoring_requires_join() {
        let client = SyncClient::new("token", Uuid::new_v4(), "ws://localhost:9090");
        assert!(matches!(
            client.insert(0, "x").await,
            Err(ProtocolError::NotJoined)
        ));
    }

    #[test]
    fn test_pending_ops_order_and_settle() {
        let mut pending = PendingOps::new(100);
        let origin = Uuid::new_v4();

        let a = Operation::insert(origin, 0, 0, "a");
        let b = Operation::insert(origin, 1, 1, "b");
        let c = Operation::insert(origin, 2, 2, "c");
        pending.insert(a.clone());
        pending.insert(b.clone());
        pending.insert(c.clone());

        pending.settle(b.client_op_id);
        let replay = pending.replay();
        assert_eq!(replay.len(), 2);
        assert_eq!(replay[0].client_op_id, a.client_op_id);
        assert_eq!(replay[1].client_op_id, c.client_op_id);
    }

    #[test]
    fn test_pending_ops_capacity() {
        let mut pending = PendingOps::new(2);
        let origin = Uuid::new_v4();

        assert!(pending.insert(Operation::insert(origin, 0, 0, "a")));
        assert!(pending.insert(Operation::insert(origin, 0, 0, "b")));
        assert!(!pending.insert(Operation::insert(origin, 0, 0, "c")));
        assert_eq!(pending.len(), 2);
    }

    #[test]
    fn test_pending_ops_settle_unknown() {
        let mut pending = PendingOps::new(8);
        assert!(pending.settle(Uuid::new_v4()).is_none());
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_shadow_applies_entries_in_order() {
        let shadow = Arc::new(RwLock::new(Shadow::default()));
        let (out_tx, mut out_rx) = mpsc::channel(16);

        let entry = |position: u64, span: crate::operation::Span| LogEntry {
            position,
            origin: Uuid::new_v4(),
            client_op_id: Uuid::new_v4(),
            span,
        };

        apply_entry(
            &shadow,
            &entry(0, crate::operation::Span::new(0, 0, "hi")),
            &out_tx,
        )
        .await;
        assert_eq!(shadow.read().await.text, "hi");
        assert_eq!(shadow.read().await.position, 1);

        // An ack for position 1 went out.
        let ack = out_rx.recv().await.unwrap();
        match ClientRequest::decode(&ack).unwrap() {
            ClientRequest::Ack { position } => assert_eq!(position, 1),
            other => panic!("unexpected {other:?}"),
        }

        // Replaying the same entry is a no-op.
        apply_entry(
            &shadow,
            &entry(0, crate::operation::Span::new(0, 0, "hi")),
            &out_tx,
        )
        .await;
        assert_eq!(shadow.read().await.text, "hi");

        // A gap triggers a catch-up request instead of applying.
        apply_entry(
            &shadow,
            &entry(5, crate::operation::Span::new(0, 0, "!")),
            &out_tx,
        )
        .await;
        assert_eq!(shadow.read().await.position, 1);
        let catch_up = out_rx.recv().await.unwrap();
        match ClientRequest::decode(&catch_up).unwrap() {
            ClientRequest::CatchUp { since } => assert_eq!(since, 1),
            other => panic!("unexpected {other:?}"),
        }
    }
}
