//! Per-document sequencing: the single mutation point.
//!
//! One sequencer per document, driven by that document's worker, so every
//! fetch-transform-check-append runs to completion before the next
//! submission is looked at. That serialization is what makes the OT
//! convergence guarantee hold without a full CRDT merge lattice.
//!
//! Per-operation state machine:
//!
//! ```text
//!  Submitted ──► Transforming ──► Appended
//!                      │
//!                      └────────► Rejected (foreign lock → ConflictRecord)
//! ```
//!
//! Resubmissions are recognized by client op id and answered with the
//! originally assigned position — an operation is never applied twice.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::{debug, trace};
use uuid::Uuid;

use crate::locks::{ConflictRecord, LockError, LockManager, LockSummary};
use crate::operation::{LogEntry, Operation};
use crate::oplog::{LogError, OperationLog};
use crate::transform::rebase;

/// Where an operation ended up.
#[derive(Debug, Clone)]
pub enum Sequenced {
    /// Appended at this entry (freshly applied).
    Applied(LogEntry),
    /// Already applied earlier under the same client op id.
    Duplicate(u64),
}

/// Submission failures.
#[derive(Debug, Clone)]
pub enum SubmitError {
    /// The base position predates the retained log.
    Stale { requested: u64, earliest: u64 },
    /// The rebased span crossed a foreign lock.
    LockConflict(ConflictRecord),
}

impl std::fmt::Display for SubmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SubmitError::Stale {
                requested,
                earliest,
            } => write!(
                f,
                "base position {requested} predates retained log (earliest {earliest})"
            ),
            SubmitError::LockConflict(record) => write!(
                f,
                "operation rejected against lock [{}, {}) held by {}",
                record.lock.start, record.lock.end, record.lock.owner
            ),
        }
    }
}

impl std::error::Error for SubmitError {}

impl From<LogError> for SubmitError {
    fn from(err: LogError) -> Self {
        let LogError::Stale {
            requested,
            earliest,
        } = err;
        SubmitError::Stale {
            requested,
            earliest,
        }
    }
}

/// The per-document authority: log + locks + idempotency ledger.
pub struct DocSequencer {
    log: OperationLog,
    locks: LockManager,
    /// client op id → assigned position, for idempotent resubmission.
    applied: HashMap<Uuid, u64>,
}

impl DocSequencer {
    pub fn new(log: OperationLog) -> Self {
        Self {
            log,
            locks: LockManager::new(),
            applied: HashMap::new(),
        }
    }

    /// Restore a recovered entry (worker restart) and remember its client
    /// op id so post-restart retries stay idempotent.
    pub fn restore_entry(&mut self, entry: LogEntry) {
        self.applied.insert(entry.client_op_id, entry.position);
        self.log.restore(entry);
    }

    /// Run one operation through rebase → lock check → append.
    pub fn submit(&mut self, op: Operation, now: Instant) -> Result<Sequenced, SubmitError> {
        if let Some(position) = self.applied.get(&op.client_op_id) {
            debug!(
                "duplicate submission {} already applied at {position}",
                op.client_op_id
            );
            return Ok(Sequenced::Duplicate(*position));
        }

        trace!(
            "op {} submitted at base {} (head {})",
            op.client_op_id,
            op.base_position,
            self.log.head_position()
        );

        // Transforming: rebase against everything appended since the base.
        let tail = self.log.entries_since(op.base_position)?;
        let span = rebase(&op.span(), tail);

        // Rejected: the rebased span touches a foreign lock.
        if let Some(lock) = self.locks.blocking_lock(&span, &[op.origin], now) {
            debug!(
                "op {} rejected against lock [{}, {}) of {}",
                op.client_op_id, lock.start, lock.end, lock.owner
            );
            return Err(SubmitError::LockConflict(ConflictRecord::new(op, lock)));
        }

        // Appended.
        let entry = self.log.append(op.origin, op.client_op_id, span);
        self.applied.insert(op.client_op_id, entry.position);
        trace!("op {} appended at {}", op.client_op_id, entry.position);
        Ok(Sequenced::Applied(entry))
    }

    /// Force-apply a previously rejected operation (conflict accepted).
    ///
    /// Rebases from the operation's original base; locks held by
    /// `ignore_lock_owner` no longer block it.
    pub fn apply_resolved(
        &mut self,
        op: Operation,
        ignore_lock_owner: Uuid,
        now: Instant,
    ) -> Result<Sequenced, SubmitError> {
        if let Some(position) = self.applied.get(&op.client_op_id) {
            return Ok(Sequenced::Duplicate(*position));
        }

        let tail = self.log.entries_since(op.base_position)?;
        let span = rebase(&op.span(), tail);

        if let Some(lock) = self
            .locks
            .blocking_lock(&span, &[op.origin, ignore_lock_owner], now)
        {
            return Err(SubmitError::LockConflict(ConflictRecord::new(op, lock)));
        }

        let entry = self.log.append(op.origin, op.client_op_id, span);
        self.applied.insert(op.client_op_id, entry.position);
        Ok(Sequenced::Applied(entry))
    }

    // Lock surface, delegated so the worker has one mutation point.

    pub fn acquire_lock(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<LockSummary, LockError> {
        self.locks.acquire(start, end, owner, ttl, now)
    }

    pub fn release_lock(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
    ) -> Result<LockSummary, LockError> {
        self.locks.release(start, end, owner)
    }

    pub fn renew_lock(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
        now: Instant,
    ) -> Result<(), LockError> {
        self.locks.renew(start, end, owner, now)
    }

    pub fn release_owner_locks(&mut self, owner: Uuid) -> Vec<LockSummary> {
        self.locks.release_owner(owner)
    }

    pub fn active_locks(&mut self, now: Instant) -> Vec<LockSummary> {
        self.locks.active(now)
    }

    pub fn lock_is_held(&self, summary: &LockSummary, now: Instant) -> bool {
        self.locks.is_held(summary, now)
    }

    // Log surface.

    pub fn head_position(&self) -> u64 {
        self.log.head_position()
    }

    pub fn head_text(&self) -> &str {
        self.log.head_text()
    }

    pub fn entries_since(&self, position: u64) -> Result<Vec<LogEntry>, LogError> {
        self.log.entries_since(position).map(|e| e.to_vec())
    }

    pub fn compact(&mut self, min_retain: u64) -> usize {
        self.log.compact(min_retain)
    }
}
