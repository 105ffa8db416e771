//! Process-local store for tests and storage-less deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::operation::LogEntry;
use crate::storage::{DocumentSnapshot, SnapshotStore, StoreError};

#[derive(Default)]
struct StoredDoc {
    snapshot: Option<DocumentSnapshot>,
    entries: Vec<LogEntry>,
}

/// In-memory [`SnapshotStore`]. Cheap to clone state out of, never fails.
#[derive(Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<Uuid, StoredDoc>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents with any persisted state.
    pub fn document_count(&self) -> usize {
        self.docs.lock().map(|d| d.len()).unwrap_or(0)
    }

    /// Stored entry count for a document (diagnostics and tests).
    pub fn entry_count(&self, doc_id: Uuid) -> usize {
        self.docs
            .lock()
            .ok()
            .and_then(|d| d.get(&doc_id).map(|doc| doc.entries.len()))
            .unwrap_or(0)
    }
}

impl SnapshotStore for MemoryStore {
    fn load_document(&self, doc_id: Uuid) -> Result<Option<DocumentSnapshot>, StoreError> {
        let docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(docs.get(&doc_id).and_then(|d| d.snapshot.clone()))
    }

    fn save_snapshot(&self, doc_id: Uuid, position: u64, text: &str) -> Result<(), StoreError> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        let doc = docs.entry(doc_id).or_default();
        doc.snapshot = Some(DocumentSnapshot {
            position,
            text: text.to_string(),
        });
        doc.entries.retain(|e| e.position >= position);
        Ok(())
    }

    fn append_entry(&self, doc_id: Uuid, entry: &LogEntry) -> Result<(), StoreError> {
        let mut docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        docs.entry(doc_id).or_default().entries.push(entry.clone());
        Ok(())
    }

    fn entries_since(&self, doc_id: Uuid, position: u64) -> Result<Vec<LogEntry>, StoreError> {
        let docs = self
            .docs
            .lock()
            .map_err(|e| StoreError::DatabaseError(e.to_string()))?;
        Ok(docs
            .get(&doc_id)
            .map(|d| {
                d.entries
                    .iter()
                    .filter(|e| e.position >= position)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}
