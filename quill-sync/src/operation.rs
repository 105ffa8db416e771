//! Core edit types: operations, normalized spans, and log entries.
//!
//! Every edit a client authors is an [`Operation`] — insert, delete, or
//! replace — expressed against a known log position. Internally all three
//! kinds reduce to a [`Span`]: delete the half-open char range
//! `[start, end)`, then insert `insert` at `start`. Working on one
//! normalized shape keeps the transform engine down to a single case
//! analysis instead of a 3×3 kind matrix.
//!
//! Offsets are `char` offsets, not byte offsets: clients edit text, and a
//! multi-byte codepoint must count as one position on every platform.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of edit a client authored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert text at an offset (range is empty).
    Insert,
    /// Remove the target range.
    Delete,
    /// Remove the target range and insert replacement text at its start.
    Replace,
}

/// Normalized edit: delete `[start, end)`, then insert `insert` at `start`.
///
/// A pure insert has `start == end`; a pure delete has an empty `insert`.
/// An empty range with an empty insert is a no-op and applying it leaves
/// the document untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub insert: String,
}

impl Span {
    pub fn new(start: usize, end: usize, insert: impl Into<String>) -> Self {
        debug_assert!(start <= end, "span range must be ordered");
        Self {
            start,
            end,
            insert: insert.into(),
        }
    }

    /// Length of the deleted range in chars.
    pub fn deleted_len(&self) -> usize {
        self.end - self.start
    }

    /// Length of the inserted text in chars.
    pub fn insert_len(&self) -> usize {
        self.insert.chars().count()
    }

    /// True if applying this span would not change any document.
    pub fn is_noop(&self) -> bool {
        self.start == self.end && self.insert.is_empty()
    }
}

/// A single edit authored by a client.
///
/// Immutable once appended to the log; rebasing produces a *new* span,
/// never mutates the original. `client_op_id` is generated by the client
/// and is the idempotency key for resubmission after a disconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Client-generated id, stable across retries of the same edit.
    pub client_op_id: Uuid,
    /// Participant that authored the edit.
    pub origin: Uuid,
    /// Log position the client believed the document was at.
    pub base_position: u64,
    pub kind: OpKind,
    /// Target char range `[start, end)` in the pre-operation document.
    pub start: usize,
    pub end: usize,
    /// Inserted text (empty for pure deletes).
    pub text: String,
}

impl Operation {
    /// Insert `text` at `offset`.
    pub fn insert(origin: Uuid, base_position: u64, offset: usize, text: impl Into<String>) -> Self {
        Self {
            client_op_id: Uuid::new_v4(),
            origin,
            base_position,
            kind: OpKind::Insert,
            start: offset,
            end: offset,
            text: text.into(),
        }
    }

    /// Delete the range `[start, end)`.
    pub fn delete(origin: Uuid, base_position: u64, start: usize, end: usize) -> Self {
        Self {
            client_op_id: Uuid::new_v4(),
            origin,
            base_position,
            kind: OpKind::Delete,
            start,
            end,
            text: String::new(),
        }
    }

    /// Replace the range `[start, end)` with `text`.
    pub fn replace(
        origin: Uuid,
        base_position: u64,
        start: usize,
        end: usize,
        text: impl Into<String>,
    ) -> Self {
        Self {
            client_op_id: Uuid::new_v4(),
            origin,
            base_position,
            kind: OpKind::Replace,
            start,
            end,
            text: text.into(),
        }
    }

    /// Reduce to the normalized delete-then-insert form.
    ///
    /// A reversed range from the wire is reordered rather than trusted.
    pub fn span(&self) -> Span {
        let (start, end) = if self.start <= self.end {
            (self.start, self.end)
        } else {
            (self.end, self.start)
        };
        Span::new(start, end, self.text.clone())
    }
}

/// An accepted operation plus its authoritative position and final span.
///
/// The log is the source of truth: document content at position N is the
/// fold of entries `[0..N)` applied in order to the empty document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Authoritative position assigned by the sequencer.
    pub position: u64,
    /// Participant that authored the original operation.
    pub origin: Uuid,
    /// The client's idempotency key for the originating operation.
    pub client_op_id: Uuid,
    /// Final span after rebasing against everything already in the log.
    pub span: Span,
}

/// Cursor state for one participant: caret offset plus selection span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Caret char offset.
    pub offset: usize,
    /// Chars selected forward from `offset` (0 = plain caret).
    pub selection: usize,
}

impl Cursor {
    pub fn at(offset: usize) -> Self {
        Self {
            offset,
            selection: 0,
        }
    }

    pub fn with_selection(offset: usize, selection: usize) -> Self {
        Self { offset, selection }
    }
}

/// Apply a span to document text, returning the new text.
///
/// Offsets are clamped to the document length: log entries are produced by
/// the sequencer and always in-bounds, but a clamped apply keeps replay of
/// a truncated store from panicking the worker.
pub fn apply(text: &str, span: &Span) -> String {
    let char_count = text.chars().count();
    let start = span.start.min(char_count);
    let end = span.end.min(char_count).max(start);

    let start_byte = char_to_byte(text, start);
    let end_byte = char_to_byte(text, end);

    let mut out = String::with_capacity(text.len() + span.insert.len());
    out.push_str(&text[..start_byte]);
    out.push_str(&span.insert);
    out.push_str(&text[end_byte..]);
    out
}

/// Byte index of the `idx`-th char (text length if past the end).
fn char_to_byte(text: &str, idx: usize) -> usize {
    text.char_indices()
        .nth(idx)
        .map(|(b, _)| b)
        .unwrap_or(text.len())
}
