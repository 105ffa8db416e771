//! Append-only per-document operation log with interval snapshots.
//!
//! The log is the single source of truth for ordering: document content at
//! position N is the fold of entries `[0..N)` over the empty document.
//! Append is the only mutation and is monotonic — entries are never
//! reordered or removed, except by explicit compaction of a prefix that is
//! already covered by a snapshot.
//!
//! ```text
//!  positions:   0        s                      head
//!               │        │                        │
//!   [compacted) [entry][entry][entry][entry][entry]
//!               ▲
//!        floor: earliest retained entry (snapshot at s covers the rest)
//! ```
//!
//! Interval snapshots keep `snapshot_at` from being O(log size) on
//! long-lived documents; requests below the retained floor fail with
//! [`LogError::Stale`] so the caller knows to hand the client a fresh
//! snapshot instead of a replay.

use std::collections::BTreeMap;

use uuid::Uuid;

use crate::operation::{apply, LogEntry, Span};

/// Position-retention failure: the requested position is older than the
/// earliest retained entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    Stale { requested: u64, earliest: u64 },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Stale {
                requested,
                earliest,
            } => write!(
                f,
                "position {requested} is no longer retained (earliest is {earliest})"
            ),
        }
    }
}

impl std::error::Error for LogError {}

/// Append-only log for one document.
pub struct OperationLog {
    /// Retained entries; `entries[0].position == floor`.
    entries: Vec<LogEntry>,
    /// Position of the earliest retained entry.
    floor: u64,
    /// Folded text at `floor` (and at every snapshot position).
    snapshots: BTreeMap<u64, String>,
    /// Folded text at the head position, maintained incrementally.
    head_text: String,
    /// Take a snapshot every this many appends.
    snapshot_interval: u64,
}

impl OperationLog {
    /// Empty log starting at position 0 with empty text.
    pub fn new(snapshot_interval: u64) -> Self {
        Self::with_base(0, String::new(), snapshot_interval)
    }

    /// Log whose history before `base` has been folded into `text`.
    ///
    /// Used when a worker restarts from a persisted snapshot: positions
    /// below `base` are gone and report [`LogError::Stale`].
    pub fn with_base(base: u64, text: String, snapshot_interval: u64) -> Self {
        let mut snapshots = BTreeMap::new();
        snapshots.insert(base, text.clone());
        Self {
            entries: Vec::new(),
            floor: base,
            snapshots,
            head_text: text,
            snapshot_interval: snapshot_interval.max(1),
        }
    }

    /// Next position to be assigned (== number of entries ever accepted).
    pub fn head_position(&self) -> u64 {
        self.floor + self.entries.len() as u64
    }

    /// Earliest position `entries_since` can serve.
    pub fn earliest_position(&self) -> u64 {
        self.floor
    }

    /// Current document text.
    pub fn head_text(&self) -> &str {
        &self.head_text
    }

    /// Append a rebased span, assigning it the next position.
    pub fn append(&mut self, origin: Uuid, client_op_id: Uuid, span: Span) -> LogEntry {
        let position = self.head_position();
        self.head_text = apply(&self.head_text, &span);
        let entry = LogEntry {
            position,
            origin,
            client_op_id,
            span,
        };
        self.entries.push(entry.clone());

        let appended = position + 1;
        if appended % self.snapshot_interval == 0 {
            self.snapshots.insert(appended, self.head_text.clone());
        }

        entry
    }

    /// Re-insert an entry recovered from the store, keeping its position.
    ///
    /// Only valid during worker restart, before any new appends; the entry
    /// must be the immediate successor of the current head.
    pub fn restore(&mut self, entry: LogEntry) {
        debug_assert_eq!(entry.position, self.head_position());
        self.head_text = apply(&self.head_text, &entry.span);
        self.entries.push(entry);
    }

    /// All entries at or after `position`, oldest first.
    pub fn entries_since(&self, position: u64) -> Result<&[LogEntry], LogError> {
        if position < self.floor {
            return Err(LogError::Stale {
                requested: position,
                earliest: self.floor,
            });
        }
        let idx = ((position - self.floor) as usize).min(self.entries.len());
        Ok(&self.entries[idx..])
    }

    /// Document text at `position` (the fold of entries `[0..position)`).
    ///
    /// Folds forward from the nearest snapshot at or below `position`.
    pub fn snapshot_at(&self, position: u64) -> Result<String, LogError> {
        if position < self.floor {
            return Err(LogError::Stale {
                requested: position,
                earliest: self.floor,
            });
        }
        let position = position.min(self.head_position());
        if position == self.head_position() {
            return Ok(self.head_text.clone());
        }

        let (snap_pos, snap_text) = self
            .snapshots
            .range(..=position)
            .next_back()
            .map(|(p, t)| (*p, t.clone()))
            // The floor snapshot always exists; see `with_base` and `compact`.
            .unwrap_or_else(|| (self.floor, String::new()));

        let mut text = snap_text;
        for entry in &self.entries[(snap_pos - self.floor) as usize..] {
            if entry.position >= position {
                break;
            }
            text = apply(&text, &entry.span);
        }
        Ok(text)
    }

    /// Drop entries below the newest snapshot at or below `min_retain`.
    ///
    /// Clients acknowledged past `min_retain` will never ask for the
    /// dropped prefix; anyone further behind becomes stale by design.
    /// Returns the number of entries dropped.
    pub fn compact(&mut self, min_retain: u64) -> usize {
        let target = match self.snapshots.range(..=min_retain).next_back() {
            Some((p, _)) => *p,
            None => return 0,
        };
        if target <= self.floor {
            return 0;
        }

        let dropped = (target - self.floor) as usize;
        self.entries.drain(..dropped);
        self.floor = target;
        self.snapshots.retain(|p, _| *p >= target);
        dropped
    }

    /// Number of retained entries.
    pub fn retained_len(&self) -> usize {
        self.entries.len()
    }
}
