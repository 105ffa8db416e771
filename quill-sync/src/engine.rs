//! The collaboration engine: per-document workers behind bounded queues.
//!
//! ```text
//! connection handlers            engine                 per-document
//! (server, tests, …)                                      workers
//!       │                          │                         │
//!       │  join/submit/lock/…      │   bounded mpsc          │
//!       ├─────────────────────────►├────────────────────────►│ doc A
//!       │                          ├────────────────────────►│ doc B
//!       │        event streams     │                         │
//!       ◄──────────────────────────┴──── broadcast ◄─────────┘
//! ```
//!
//! One tokio task per active document drives that document's sequencer
//! and is the sole writer of its log, lock table, and roster — no lock is
//! ever taken around document state. Handlers talk to the worker over a
//! bounded command channel; a full queue yields `Backpressured` for
//! submissions instead of queueing unboundedly.
//!
//! A worker that stops (idle session expiry, panic) closes its channel.
//! The engine notices on the next call and restarts it from the persisted
//! snapshot plus stored log tail, so one document's failure never touches
//! another document's worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot, RwLock};
use uuid::Uuid;

use crate::broadcast::{DocEvent, EventFan, EventStream};
use crate::locks::{ConflictRecord, ConflictState, LockError, LockSummary};
use crate::operation::{Cursor, LogEntry, Operation};
use crate::oplog::OperationLog;
use crate::sequencer::{DocSequencer, Sequenced, SubmitError};
use crate::session::{Participant, Roster};
use crate::storage::{SnapshotStore, StoreError};

/// Engine tuning knobs. All timeouts are configuration, not protocol.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// A participant with no heartbeat for this long is disconnected.
    pub heartbeat_timeout: Duration,
    /// An empty session lingers this long before its worker exits,
    /// so a brief reconnect does not lose session state.
    pub session_grace: Duration,
    /// Lock ttl used when the caller does not pass one.
    pub default_lock_ttl: Duration,
    /// Command queue depth per document worker.
    pub queue_depth: usize,
    /// In-memory log snapshot interval (entries).
    pub snapshot_interval: u64,
    /// Minimum time between store snapshots of a dirty document.
    pub persist_interval: Duration,
    /// Events buffered per subscriber before it lags.
    pub broadcast_capacity: usize,
    /// Worker housekeeping interval (sweeps, persistence).
    pub tick_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            session_grace: Duration::from_secs(15),
            default_lock_ttl: Duration::from_secs(30),
            queue_depth: 64,
            snapshot_interval: 64,
            persist_interval: Duration::from_secs(5),
            broadcast_capacity: 256,
            tick_interval: Duration::from_secs(1),
        }
    }
}

impl EngineConfig {
    /// Tight intervals for tests.
    pub fn for_testing() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            session_grace: Duration::from_millis(200),
            default_lock_ttl: Duration::from_secs(30),
            queue_depth: 16,
            snapshot_interval: 8,
            persist_interval: Duration::from_millis(50),
            broadcast_capacity: 64,
            tick_interval: Duration::from_millis(25),
        }
    }
}

/// Engine call failures. Everything here is recoverable at the call site.
#[derive(Debug, Clone)]
pub enum EngineError {
    /// Requested log position is older than anything retained; the client
    /// must refetch a fresh snapshot.
    StaleClient { requested: u64, earliest: u64 },
    /// The document worker's queue is full; retry after a short delay.
    Backpressured,
    /// Lock acquisition hit a live foreign lock.
    Conflict(LockSummary),
    /// Lock release/renew by someone who does not hold it.
    NotOwner,
    /// Lock renew arrived after the lock already expired.
    Expired,
    /// The session handle no longer maps to a live participant/worker.
    Disconnected,
    /// Persistence collaborator failure.
    Store(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::StaleClient {
                requested,
                earliest,
            } => write!(
                f,
                "stale client: position {requested} not retained (earliest {earliest})"
            ),
            EngineError::Backpressured => write!(f, "document queue full, retry with backoff"),
            EngineError::Conflict(lock) => write!(
                f,
                "range [{}, {}) is locked by {}",
                lock.start, lock.end, lock.owner
            ),
            EngineError::NotOwner => write!(f, "lock not held by this participant"),
            EngineError::Expired => write!(f, "lock already expired"),
            EngineError::Disconnected => write!(f, "session is disconnected"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Outcome of a submission that reached the sequencer.
#[derive(Debug, Clone)]
pub enum SubmitStatus {
    /// Accepted and appended at this position (or already applied there).
    Appended(u64),
    /// Rejected against a foreign lock; resolve or resubmit later.
    Rejected(ConflictRecord),
}

/// Capability to act on a document as a specific participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle {
    pub doc_id: Uuid,
    pub participant_id: Uuid,
}

/// Everything a joining client needs to render the document.
#[derive(Debug, Clone)]
pub struct JoinState {
    pub position: u64,
    pub text: String,
    pub locks: Vec<LockSummary>,
    pub presence: Vec<Participant>,
}

enum DocCommand {
    Join {
        participant: Participant,
        reply: oneshot::Sender<(JoinState, EventStream)>,
    },
    Leave {
        participant_id: Uuid,
    },
    Submit {
        op: Operation,
        reply: oneshot::Sender<Result<SubmitStatus, EngineError>>,
    },
    AcquireLock {
        owner: Uuid,
        start: usize,
        end: usize,
        ttl: Duration,
        reply: oneshot::Sender<Result<LockSummary, EngineError>>,
    },
    ReleaseLock {
        owner: Uuid,
        start: usize,
        end: usize,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    RenewLock {
        owner: Uuid,
        start: usize,
        end: usize,
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Cursor {
        participant_id: Uuid,
        cursor: Cursor,
    },
    Heartbeat {
        participant_id: Uuid,
    },
    Ack {
        participant_id: Uuid,
        position: u64,
    },
    ResolveConflict {
        resolver: Uuid,
        conflict_id: Uuid,
        accept: bool,
        reply: oneshot::Sender<Result<Option<u64>, EngineError>>,
    },
    CatchUp {
        since: u64,
        reply: oneshot::Sender<Result<Vec<LogEntry>, EngineError>>,
    },
    Subscribe {
        reply: oneshot::Sender<EventStream>,
    },
}

/// The engine front: owns the worker map, hands out session handles.
pub struct CollabEngine {
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    docs: RwLock<HashMap<Uuid, mpsc::Sender<DocCommand>>>,
}

impl CollabEngine {
    pub fn new(config: EngineConfig, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            config,
            store,
            docs: RwLock::new(HashMap::new()),
        }
    }

    /// Join a document session, creating the worker on first join.
    ///
    /// The returned stream was subscribed inside the same worker step that
    /// produced the snapshot, so there is no gap between the two.
    pub async fn join(
        &self,
        doc_id: Uuid,
        participant: Participant,
    ) -> Result<(SessionHandle, JoinState, EventStream), EngineError> {
        let participant_id = participant.id;
        let (state, stream) = self
            .request(doc_id, |reply| DocCommand::Join {
                participant: participant.clone(),
                reply,
            })
            .await?;
        Ok((
            SessionHandle {
                doc_id,
                participant_id,
            },
            state,
            stream,
        ))
    }

    /// Leave the session. Locks are released, presence is updated.
    pub async fn leave(&self, handle: SessionHandle) {
        if let Ok(tx) = self.channel(handle.doc_id).await {
            let _ = tx
                .send(DocCommand::Leave {
                    participant_id: handle.participant_id,
                })
                .await;
        }
    }

    /// Submit an operation for sequencing.
    ///
    /// Returns `Backpressured` immediately when the document queue is
    /// full. If the worker died mid-flight, the retry after respawn is
    /// safe: resubmission is idempotent by client op id.
    pub async fn submit(
        &self,
        handle: SessionHandle,
        op: Operation,
    ) -> Result<SubmitStatus, EngineError> {
        for _ in 0..2 {
            let tx = self.channel(handle.doc_id).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            match tx.try_send(DocCommand::Submit {
                op: op.clone(),
                reply: reply_tx,
            }) {
                Ok(()) => match reply_rx.await {
                    Ok(result) => return result,
                    Err(_) => {
                        warn!(
                            "document {} worker dropped a submission reply; retrying",
                            handle.doc_id
                        );
                    }
                },
                Err(mpsc::error::TrySendError::Full(_)) => {
                    return Err(EngineError::Backpressured);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
            self.forget_worker(handle.doc_id).await;
        }
        Err(EngineError::Disconnected)
    }

    /// Acquire an exclusive editing range.
    pub async fn acquire_lock(
        &self,
        handle: SessionHandle,
        start: usize,
        end: usize,
        ttl: Option<Duration>,
    ) -> Result<LockSummary, EngineError> {
        let ttl = ttl.unwrap_or(self.config.default_lock_ttl);
        self.request(handle.doc_id, |reply| DocCommand::AcquireLock {
            owner: handle.participant_id,
            start,
            end,
            ttl,
            reply,
        })
        .await?
    }

    pub async fn release_lock(
        &self,
        handle: SessionHandle,
        start: usize,
        end: usize,
    ) -> Result<(), EngineError> {
        self.request(handle.doc_id, |reply| DocCommand::ReleaseLock {
            owner: handle.participant_id,
            start,
            end,
            reply,
        })
        .await?
    }

    pub async fn renew_lock(
        &self,
        handle: SessionHandle,
        start: usize,
        end: usize,
    ) -> Result<(), EngineError> {
        self.request(handle.doc_id, |reply| DocCommand::RenewLock {
            owner: handle.participant_id,
            start,
            end,
            reply,
        })
        .await?
    }

    /// Update this participant's cursor. Lossy under pressure by design —
    /// a newer position always follows.
    pub async fn update_cursor(&self, handle: SessionHandle, cursor: Cursor) {
        if let Ok(tx) = self.channel(handle.doc_id).await {
            let _ = tx.try_send(DocCommand::Cursor {
                participant_id: handle.participant_id,
                cursor,
            });
        }
    }

    pub async fn heartbeat(&self, handle: SessionHandle) {
        if let Ok(tx) = self.channel(handle.doc_id).await {
            let _ = tx.try_send(DocCommand::Heartbeat {
                participant_id: handle.participant_id,
            });
        }
    }

    /// Record the highest log position the client has applied.
    pub async fn ack(&self, handle: SessionHandle, position: u64) {
        if let Ok(tx) = self.channel(handle.doc_id).await {
            let _ = tx.try_send(DocCommand::Ack {
                participant_id: handle.participant_id,
                position,
            });
        }
    }

    /// Accept or reject a pending conflict. Returns the applied position
    /// when accepting lands the operation.
    pub async fn resolve_conflict(
        &self,
        handle: SessionHandle,
        conflict_id: Uuid,
        accept: bool,
    ) -> Result<Option<u64>, EngineError> {
        self.request(handle.doc_id, |reply| DocCommand::ResolveConflict {
            resolver: handle.participant_id,
            conflict_id,
            accept,
            reply,
        })
        .await?
    }

    /// Entries at or after `since`, for reconnect catch-up.
    pub async fn catch_up(
        &self,
        handle: SessionHandle,
        since: u64,
    ) -> Result<Vec<LogEntry>, EngineError> {
        self.request(handle.doc_id, |reply| DocCommand::CatchUp { since, reply })
            .await?
    }

    /// A fresh event stream (used after catching up from a lag).
    pub async fn subscribe(&self, handle: SessionHandle) -> Result<EventStream, EngineError> {
        self.request(handle.doc_id, |reply| DocCommand::Subscribe { reply })
            .await
    }

    /// Number of live document workers.
    pub async fn active_documents(&self) -> usize {
        let docs = self.docs.read().await;
        docs.values().filter(|tx| !tx.is_closed()).count()
    }

    // ── Worker plumbing ──────────────────────────────────────────────

    /// Send a command and await its reply, respawning a dead worker once.
    async fn request<T>(
        &self,
        doc_id: Uuid,
        build: impl Fn(oneshot::Sender<T>) -> DocCommand,
    ) -> Result<T, EngineError> {
        for _ in 0..2 {
            let tx = self.channel(doc_id).await?;
            let (reply_tx, reply_rx) = oneshot::channel();
            if tx.send(build(reply_tx)).await.is_ok() {
                if let Ok(value) = reply_rx.await {
                    return Ok(value);
                }
            }
            self.forget_worker(doc_id).await;
        }
        Err(EngineError::Disconnected)
    }

    /// Worker channel for a document, spawning or respawning as needed.
    async fn channel(&self, doc_id: Uuid) -> Result<mpsc::Sender<DocCommand>, EngineError> {
        {
            let docs = self.docs.read().await;
            if let Some(tx) = docs.get(&doc_id) {
                if !tx.is_closed() {
                    return Ok(tx.clone());
                }
            }
        }

        let mut docs = self.docs.write().await;
        // Double-check after taking the write lock.
        if let Some(tx) = docs.get(&doc_id) {
            if !tx.is_closed() {
                return Ok(tx.clone());
            }
        }

        let worker = DocWorker::bootstrap(doc_id, self.config.clone(), self.store.clone())
            .map_err(|e| EngineError::Store(e.to_string()))?;
        let (tx, rx) = mpsc::channel(self.config.queue_depth);
        tokio::spawn(worker.run(rx));
        docs.insert(doc_id, tx.clone());
        Ok(tx)
    }

    async fn forget_worker(&self, doc_id: Uuid) {
        let mut docs = self.docs.write().await;
        if let Some(tx) = docs.get(&doc_id) {
            if tx.is_closed() {
                docs.remove(&doc_id);
            }
        }
    }
}

/// Per-document worker: the only code that mutates this document's state.
struct DocWorker {
    doc_id: Uuid,
    config: EngineConfig,
    store: Arc<dyn SnapshotStore>,
    seq: DocSequencer,
    roster: Roster,
    fan: EventFan,
    /// Pending conflicts, by record id.
    conflicts: HashMap<Uuid, ConflictRecord>,
    /// When the roster last became empty.
    empty_since: Option<Instant>,
    /// Head position covered by the last store snapshot.
    last_persisted: u64,
    last_persist_at: Instant,
}

impl DocWorker {
    /// Restore worker state from the store: snapshot plus log tail.
    fn bootstrap(
        doc_id: Uuid,
        config: EngineConfig,
        store: Arc<dyn SnapshotStore>,
    ) -> Result<Self, StoreError> {
        let snapshot = store.load_document(doc_id)?;
        let (base, text) = snapshot
            .map(|s| (s.position, s.text))
            .unwrap_or((0, String::new()));

        let log = OperationLog::with_base(base, text, config.snapshot_interval);
        let mut seq = DocSequencer::new(log);

        let tail = store.entries_since(doc_id, base)?;
        let mut replayed = 0usize;
        for entry in tail {
            if entry.position != seq.head_position() {
                warn!(
                    "document {doc_id}: gap in stored tail at {} (head {}), truncating replay",
                    entry.position,
                    seq.head_position()
                );
                break;
            }
            seq.restore_entry(entry);
            replayed += 1;
        }

        if base > 0 || replayed > 0 {
            info!(
                "document {doc_id}: restored snapshot at {base}, replayed {replayed} entries \
                 (head {})",
                seq.head_position()
            );
        }

        let last_persisted = base;
        Ok(Self {
            doc_id,
            fan: EventFan::new(config.broadcast_capacity),
            config,
            store,
            seq,
            roster: Roster::new(),
            conflicts: HashMap::new(),
            empty_since: Some(Instant::now()),
            last_persisted,
            last_persist_at: Instant::now(),
        })
    }

    async fn run(mut self, mut rx: mpsc::Receiver<DocCommand>) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    // Engine dropped; nothing can reach us anymore.
                    None => break,
                },
                _ = tick.tick() => {
                    if self.on_tick() {
                        break;
                    }
                }
            }
        }

        self.persist(true);
        debug!("document {} worker stopped", self.doc_id);
    }

    fn handle(&mut self, cmd: DocCommand) {
        let now = Instant::now();
        match cmd {
            DocCommand::Join { participant, reply } => {
                let is_new = self.roster.join(participant.clone(), now);
                self.empty_since = None;

                let state = JoinState {
                    position: self.seq.head_position(),
                    text: self.seq.head_text().to_string(),
                    locks: self.seq.active_locks(now),
                    presence: self.roster.participants(),
                };
                let stream = self.fan.subscribe();
                if reply.send((state, stream)).is_ok() {
                    if is_new {
                        info!(
                            "participant {} ({}) joined document {}",
                            participant.display_name, participant.id, self.doc_id
                        );
                        self.fan.emit(DocEvent::ParticipantJoined(participant));
                    }
                } else if is_new {
                    // Caller went away before the reply landed.
                    self.roster.leave(participant.id);
                }
            }

            DocCommand::Leave { participant_id } => {
                self.drop_participant(participant_id, "left");
            }

            DocCommand::Submit { op, reply } => {
                let origin = op.origin;
                let result = self.sequence(op, now);
                let _ = reply.send(result);
                // A submission is liveness too.
                self.roster.heartbeat(origin, now);
            }

            DocCommand::AcquireLock {
                owner,
                start,
                end,
                ttl,
                reply,
            } => {
                let result = match self.seq.acquire_lock(start, end, owner, ttl, now) {
                    Ok(lock) => {
                        self.fan.emit(DocEvent::LockChanged {
                            lock,
                            released: false,
                        });
                        Ok(lock)
                    }
                    Err(LockError::Conflict(existing)) => Err(EngineError::Conflict(existing)),
                    Err(LockError::NotOwner) => Err(EngineError::NotOwner),
                    Err(LockError::Expired) => Err(EngineError::Expired),
                };
                let _ = reply.send(result);
            }

            DocCommand::ReleaseLock {
                owner,
                start,
                end,
                reply,
            } => {
                let result = match self.seq.release_lock(start, end, owner) {
                    Ok(lock) => {
                        self.fan.emit(DocEvent::LockChanged {
                            lock,
                            released: true,
                        });
                        Ok(())
                    }
                    Err(_) => Err(EngineError::NotOwner),
                };
                let _ = reply.send(result);
            }

            DocCommand::RenewLock {
                owner,
                start,
                end,
                reply,
            } => {
                let result = match self.seq.renew_lock(start, end, owner, now) {
                    Ok(()) => Ok(()),
                    Err(_) => Err(EngineError::Expired),
                };
                let _ = reply.send(result);
            }

            DocCommand::Cursor {
                participant_id,
                cursor,
            } => {
                if self.roster.update_cursor(participant_id, cursor, now) {
                    self.fan.emit(DocEvent::CursorMoved {
                        participant_id,
                        cursor,
                    });
                }
            }

            DocCommand::Heartbeat { participant_id } => {
                self.roster.heartbeat(participant_id, now);
            }

            DocCommand::Ack {
                participant_id,
                position,
            } => {
                self.roster.ack(participant_id, position);
            }

            DocCommand::ResolveConflict {
                resolver,
                conflict_id,
                accept,
                reply,
            } => {
                let result = self.resolve_conflict(resolver, conflict_id, accept, now);
                let _ = reply.send(result);
            }

            DocCommand::CatchUp { since, reply } => {
                let result = self.seq.entries_since(since).map_err(|e| {
                    let crate::oplog::LogError::Stale {
                        requested,
                        earliest,
                    } = e;
                    EngineError::StaleClient {
                        requested,
                        earliest,
                    }
                });
                let _ = reply.send(result);
            }

            DocCommand::Subscribe { reply } => {
                let _ = reply.send(self.fan.subscribe());
            }
        }
    }

    /// The fetch-transform-check-append pipeline for one operation.
    fn sequence(&mut self, op: Operation, now: Instant) -> Result<SubmitStatus, EngineError> {
        match self.seq.submit(op, now) {
            Ok(Sequenced::Applied(entry)) => {
                if let Err(e) = self.store.append_entry(self.doc_id, &entry) {
                    // The in-memory log is authoritative; persistence will
                    // catch up at the next snapshot.
                    error!(
                        "document {}: failed to persist entry {}: {e}",
                        self.doc_id, entry.position
                    );
                }
                let position = entry.position;
                self.fan.emit(DocEvent::OperationApplied(entry));
                Ok(SubmitStatus::Appended(position))
            }
            Ok(Sequenced::Duplicate(position)) => Ok(SubmitStatus::Appended(position)),
            Err(SubmitError::Stale {
                requested,
                earliest,
            }) => Err(EngineError::StaleClient {
                requested,
                earliest,
            }),
            Err(SubmitError::LockConflict(record)) => {
                self.conflicts.insert(record.id, record.clone());
                self.fan.emit(DocEvent::ConflictRaised(record.clone()));
                Ok(SubmitStatus::Rejected(record))
            }
        }
    }

    fn resolve_conflict(
        &mut self,
        resolver: Uuid,
        conflict_id: Uuid,
        accept: bool,
        now: Instant,
    ) -> Result<Option<u64>, EngineError> {
        let record = match self.conflicts.get(&conflict_id) {
            Some(record) if record.state == ConflictState::Pending => record.clone(),
            _ => return Err(EngineError::Disconnected),
        };

        if accept {
            // Only the blocked lock's owner can wave the edit through.
            if resolver != record.lock.owner {
                return Err(EngineError::NotOwner);
            }
            match self
                .seq
                .apply_resolved(record.operation.clone(), record.lock.owner, now)
            {
                Ok(Sequenced::Applied(entry)) => {
                    if let Err(e) = self.store.append_entry(self.doc_id, &entry) {
                        error!(
                            "document {}: failed to persist entry {}: {e}",
                            self.doc_id, entry.position
                        );
                    }
                    let position = entry.position;
                    self.fan.emit(DocEvent::OperationApplied(entry));
                    if let Some(stored) = self.conflicts.get_mut(&conflict_id) {
                        stored.state = ConflictState::Accepted;
                        stored.resolved_by = Some(resolver);
                    }
                    Ok(Some(position))
                }
                Ok(Sequenced::Duplicate(position)) => Ok(Some(position)),
                Err(SubmitError::Stale {
                    requested,
                    earliest,
                }) => Err(EngineError::StaleClient {
                    requested,
                    earliest,
                }),
                Err(SubmitError::LockConflict(next)) => Err(EngineError::Conflict(next.lock)),
            }
        } else {
            // The author or the lock owner may reject.
            if resolver != record.lock.owner && resolver != record.operation.origin {
                return Err(EngineError::NotOwner);
            }
            if let Some(stored) = self.conflicts.get_mut(&conflict_id) {
                stored.state = ConflictState::Rejected;
                stored.resolved_by = Some(resolver);
            }
            Ok(None)
        }
    }

    /// Housekeeping. Returns true when the session should shut down.
    fn on_tick(&mut self) -> bool {
        let now = Instant::now();

        // Heartbeat sweep: disconnected participants lose presence and
        // locks, but their applied-op ledger stays for idempotent retries.
        let timed_out = self
            .roster
            .sweep_timeouts(now, self.config.heartbeat_timeout);
        for participant in timed_out {
            info!(
                "participant {} timed out of document {}",
                participant.id, self.doc_id
            );
            self.release_locks_of(participant.id);
            self.fan.emit(DocEvent::ParticipantLeft(participant.id));
        }

        // Conflicts expire with the lock that raised them.
        self.conflicts.retain(|_, record| {
            record.state != ConflictState::Pending || self.seq.lock_is_held(&record.lock, now)
        });

        // Empty-session grace, then shut down.
        if self.roster.is_empty() {
            let since = *self.empty_since.get_or_insert(now);
            if now.duration_since(since) >= self.config.session_grace {
                return true;
            }
        } else {
            self.empty_since = None;
        }

        self.persist(false);

        // Trim the in-memory log below what every client has applied; the
        // store snapshot also bounds how far back a catch-up can reach.
        if let Some(min_acked) = self.roster.min_acked() {
            let floor = min_acked.min(self.last_persisted);
            if floor > 0 {
                self.seq.compact(floor);
            }
        }

        false
    }

    fn drop_participant(&mut self, participant_id: Uuid, why: &str) {
        if let Some(participant) = self.roster.leave(participant_id) {
            debug!(
                "participant {} {} document {}",
                participant.id, why, self.doc_id
            );
            self.release_locks_of(participant_id);
            self.fan.emit(DocEvent::ParticipantLeft(participant_id));
            if self.roster.is_empty() {
                self.empty_since = Some(Instant::now());
            }
        }
    }

    fn release_locks_of(&mut self, participant_id: Uuid) {
        for lock in self.seq.release_owner_locks(participant_id) {
            self.fan.emit(DocEvent::LockChanged {
                lock,
                released: true,
            });
        }
    }

    /// Snapshot the folded document into the store.
    fn persist(&mut self, force: bool) {
        let head = self.seq.head_position();
        if head <= self.last_persisted {
            return;
        }
        if !force && self.last_persist_at.elapsed() < self.config.persist_interval {
            return;
        }

        match self
            .store
            .save_snapshot(self.doc_id, head, self.seq.head_text())
        {
            Ok(()) => {
                debug!("document {}: snapshot saved at {head}", self.doc_id);
                self.last_persisted = head;
                self.last_persist_at = Instant::now();
            }
            Err(e) => {
                error!("document {}: snapshot failed: {e}", self.doc_id);
            }
        }
    }
}
