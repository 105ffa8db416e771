//! # quill-sync — Real-time collaborative document synchronization
//!
//! Multiple participants edit one document concurrently and converge on a
//! single consistent state, using server-sequenced operational
//! transformation (OT) rather than CRDT merging.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ SyncClient  │ ◄─────────────────► │ SyncServer  │
//! │ (per user)  │    Binary Proto     │ (central)   │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │ Text shadow │                     │ CollabEngine│
//! │ + pending   │                     │ (authority) │
//! └─────────────┘                     └──────┬──────┘
//!                                            │ one worker per document
//!                              ┌─────────────┼─────────────┐
//!                              ▼             ▼             ▼
//!                        OperationLog   LockManager     Roster
//!                              │
//!                              ▼
//!                        SnapshotStore (RocksDB / memory)
//! ```
//!
//! A client submits an operation against the log position it last saw.
//! The document's worker rebases it over everything appended since
//! ([`transform`]), validates it against foreign locks, appends it to the
//! log, and fans it out to every subscriber in log order — including the
//! origin, which reconciles its optimistic state against the
//! authoritative entry.
//!
//! ## Modules
//!
//! - [`operation`] — operations, normalized spans, log entries
//! - [`transform`] — the OT core: rebase one edit over another
//! - [`oplog`] — append-only per-document log with interval snapshots
//! - [`locks`] — exclusive ranges with ttl and conflict records
//! - [`sequencer`] — the per-document fetch-transform-check-append path
//! - [`session`] — presence roster, heartbeats, identity resolution
//! - [`broadcast`] — ordered event fan-out with lag detection
//! - [`engine`] — per-document workers behind bounded command queues
//! - [`protocol`] — bincode wire messages for the WebSocket transport
//! - [`server`] — WebSocket sync server
//! - [`client`] — WebSocket sync client with idempotent replay
//! - [`storage`] — snapshot + log-tail persistence (RocksDB, memory)

pub mod broadcast;
pub mod client;
pub mod engine;
pub mod locks;
pub mod operation;
pub mod oplog;
pub mod protocol;
pub mod sequencer;
pub mod server;
pub mod session;
pub mod storage;
pub mod transform;

// Re-exports for convenience
pub use broadcast::{DocEvent, EventFan, EventStream, StreamError};
pub use client::{ClientEvent, ConnectionState, PendingOps, SyncClient};
pub use engine::{
    CollabEngine, EngineConfig, EngineError, JoinState, SessionHandle, SubmitStatus,
};
pub use locks::{ConflictRecord, ConflictState, LockError, LockManager, LockSummary, LockedRange};
pub use operation::{apply, Cursor, LogEntry, OpKind, Operation, Span};
pub use oplog::{LogError, OperationLog};
pub use protocol::{ClientRequest, ProtocolError, ServerMessage, SubmitReply};
pub use sequencer::{DocSequencer, Sequenced, SubmitError};
pub use server::{ServerConfig, ServerStats, SyncServer};
pub use session::{IdentityError, IdentityProvider, Participant, Roster, StaticIdentity};
pub use storage::{
    DocumentMetadata, DocumentSnapshot, DocumentStore, MemoryStore, SnapshotStore, StoreConfig,
    StoreError,
};
pub use transform::{map_offset, rebase, transform};
