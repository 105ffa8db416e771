//! Durable storage behind the engine.
//!
//! The engine talks to persistence through [`SnapshotStore`]: load a
//! document, save a folded snapshot, and keep the log entries appended
//! since the last snapshot so a restarted worker can replay
//! snapshot + tail. Two implementations ship here:
//!
//! - [`MemoryStore`] — process-local, for tests and storage-less
//!   deployments.
//! - [`DocumentStore`] — RocksDB column families with LZ4-compressed
//!   snapshots, the production backend.

pub mod memory;
pub mod rocks;

use uuid::Uuid;

use crate::operation::LogEntry;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

/// Storage errors.
#[derive(Debug, Clone)]
pub enum StoreError {
    /// Backend failure (database, filesystem).
    DatabaseError(String),
    /// Document not found.
    NotFound(Uuid),
    /// Serialization failed.
    SerializationError(String),
    /// Deserialization failed.
    DeserializationError(String),
    /// Compression failed.
    CompressionError(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "database error: {e}"),
            StoreError::NotFound(id) => write!(f, "document not found: {id}"),
            StoreError::SerializationError(e) => write!(f, "serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            StoreError::CompressionError(e) => write!(f, "compression error: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// A persisted fold of a document: text at a log position.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DocumentSnapshot {
    pub position: u64,
    pub text: String,
}

/// Persistence collaborator for document workers.
///
/// `save_snapshot` also prunes stored entries at or below the snapshot
/// position — the snapshot subsumes them, and pruning is what bounds
/// replay cost for long-lived documents.
pub trait SnapshotStore: Send + Sync {
    /// Latest persisted snapshot, or `None` for a brand-new document.
    fn load_document(&self, doc_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError>;

    /// Persist the folded text at `position` and prune covered entries.
    fn save_snapshot(&self, doc_id: Uuid, position: u64, text: &str) -> Result<(), StoreError>;

    /// Persist one accepted log entry.
    fn append_entry(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), StoreError>;

    /// Stored entries at or after `position`, oldest first.
    fn entries_since(&self, doc_id: Uuid, position: u64) -> Result<Vec<LogEntry>, StoreError>;
}
