//! Exclusive editing ranges with owner, ttl, and lazy expiry.
//!
//! Two ranges conflict iff they overlap (half-open intersection) and have
//! different owners. Expired locks are purged lazily on the next
//! acquire/renew/validation touching an overlapping region — staleness
//! only matters at the moment another participant wants the range, so no
//! background sweep is needed.
//!
//! Locks are scoped to participant id, not connection: a participant that
//! reconnects under the same identity still owns its ranges.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::{Operation, Span};

/// A held lock.
#[derive(Debug, Clone)]
pub struct LockedRange {
    pub start: usize,
    pub end: usize,
    pub owner: Uuid,
    pub acquired_at: Instant,
    pub ttl: Duration,
}

impl LockedRange {
    fn expired(&self, now: Instant) -> bool {
        now.duration_since(self.acquired_at) >= self.ttl
    }

    fn overlaps(&self, start: usize, end: usize) -> bool {
        self.start.max(start) < self.end.min(end)
    }

    /// Whether an insertion at `offset` would land strictly inside the
    /// locked range. Boundary inserts do not touch locked content.
    fn covers_insert(&self, offset: usize) -> bool {
        self.start < offset && offset < self.end
    }

    pub fn summary(&self) -> LockSummary {
        LockSummary {
            start: self.start,
            end: self.end,
            owner: self.owner,
        }
    }
}

/// Wire-safe view of a lock (no clock state).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockSummary {
    pub start: usize,
    pub end: usize,
    pub owner: Uuid,
}

/// Lock operation failures.
#[derive(Debug, Clone)]
pub enum LockError {
    /// A different owner already holds an overlapping range.
    Conflict(LockSummary),
    /// Release attempted by someone who does not hold the range.
    NotOwner,
    /// Renew attempted on a lock that already expired (or was never held).
    Expired,
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Conflict(existing) => write!(
                f,
                "range [{}, {}) is locked by {}",
                existing.start, existing.end, existing.owner
            ),
            LockError::NotOwner => write!(f, "lock is not held by this participant"),
            LockError::Expired => write!(f, "lock has expired"),
        }
    }
}

impl std::error::Error for LockError {}

/// Resolution state of a conflict record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictState {
    Pending,
    Accepted,
    Rejected,
}

/// A rejected operation awaiting an explicit accept/reject decision.
///
/// Raised when a rebased operation crosses a foreign lock. Never silently
/// dropped: the record stays pending until a participant resolves it or
/// the blocking lock expires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictRecord {
    pub id: Uuid,
    pub operation: Operation,
    pub lock: LockSummary,
    pub state: ConflictState,
    pub resolved_by: Option<Uuid>,
}

impl ConflictRecord {
    pub fn new(operation: Operation, lock: LockSummary) -> Self {
        Self {
            id: Uuid::new_v4(),
            operation,
            lock,
            state: ConflictState::Pending,
            resolved_by: None,
        }
    }
}

/// Per-document lock table. Mutated only by the document's worker.
#[derive(Default)]
pub struct LockManager {
    locks: Vec<LockedRange>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `[start, end)` for `owner`.
    ///
    /// Re-acquiring an identical range the owner already holds refreshes
    /// its ttl (reconnect reclaims ownership). Overlapping a different
    /// owner's live lock fails with the existing range.
    pub fn acquire(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
        ttl: Duration,
        now: Instant,
    ) -> Result<LockSummary, LockError> {
        self.purge_overlapping_expired(start, end, now);

        if let Some(existing) = self
            .locks
            .iter()
            .find(|l| l.owner != owner && l.overlaps(start, end))
        {
            return Err(LockError::Conflict(existing.summary()));
        }

        if let Some(held) = self
            .locks
            .iter_mut()
            .find(|l| l.owner == owner && l.start == start && l.end == end)
        {
            held.acquired_at = now;
            held.ttl = ttl;
            return Ok(held.summary());
        }

        let lock = LockedRange {
            start,
            end,
            owner,
            acquired_at: now,
            ttl,
        };
        let summary = lock.summary();
        self.locks.push(lock);
        Ok(summary)
    }

    /// Release `[start, end)` held by `owner`.
    pub fn release(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
    ) -> Result<LockSummary, LockError> {
        let idx = self
            .locks
            .iter()
            .position(|l| l.owner == owner && l.start == start && l.end == end)
            .ok_or(LockError::NotOwner)?;
        Ok(self.locks.swap_remove(idx).summary())
    }

    /// Refresh the ttl of a held lock.
    pub fn renew(
        &mut self,
        start: usize,
        end: usize,
        owner: Uuid,
        now: Instant,
    ) -> Result<(), LockError> {
        self.purge_overlapping_expired(start, end, now);
        match self
            .locks
            .iter_mut()
            .find(|l| l.owner == owner && l.start == start && l.end == end)
        {
            Some(lock) => {
                lock.acquired_at = now;
                Ok(())
            }
            None => Err(LockError::Expired),
        }
    }

    /// Release every lock held by `owner` (disconnect path).
    pub fn release_owner(&mut self, owner: Uuid) -> Vec<LockSummary> {
        let mut released = Vec::new();
        self.locks.retain(|l| {
            if l.owner == owner {
                released.push(l.summary());
                false
            } else {
                true
            }
        });
        released
    }

    /// First live lock the span would touch whose owner is not exempt.
    ///
    /// Deletes conflict on half-open overlap; a pure insert conflicts only
    /// strictly inside a foreign range. `exempt` is normally just the
    /// acting participant; conflict resolution also exempts the lock owner
    /// who accepted the edit.
    pub fn blocking_lock(
        &mut self,
        span: &Span,
        exempt: &[Uuid],
        now: Instant,
    ) -> Option<LockSummary> {
        self.purge_overlapping_expired(span.start, span.end.max(span.start.saturating_add(1)), now);
        self.locks
            .iter()
            .filter(|l| !exempt.contains(&l.owner))
            .find(|l| {
                if span.start == span.end {
                    l.covers_insert(span.start)
                } else {
                    l.overlaps(span.start, span.end)
                }
            })
            .map(|l| l.summary())
    }

    /// Live locks, purging anything already expired.
    pub fn active(&mut self, now: Instant) -> Vec<LockSummary> {
        self.locks.retain(|l| !l.expired(now));
        self.locks.iter().map(|l| l.summary()).collect()
    }

    /// Whether a specific lock is still live.
    pub fn is_held(&self, summary: &LockSummary, now: Instant) -> bool {
        self.locks.iter().any(|l| {
            l.owner == summary.owner
                && l.start == summary.start
                && l.end == summary.end
                && !l.expired(now)
        })
    }

    fn purge_overlapping_expired(&mut self, start: usize, end: usize, now: Instant) {
        self.locks
            .retain(|l| !(l.expired(now) && l.overlaps(start, end)));
    }
}
