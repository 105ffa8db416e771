//! Participant presence: join/leave lifecycle, heartbeats, cursors.
//!
//! The roster is owned by the document worker and mutated only on its
//! thread, so there is no locking here. A participant is considered
//! disconnected when no heartbeat arrives within the configured timeout;
//! the sweep removes it from presence and the worker releases its locks,
//! but the participant's applied-operation history survives in the
//! sequencer so an idempotent resubmission still works.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::operation::Cursor;

/// A connected participant's identity as shared with every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    pub id: Uuid,
    pub display_name: String,
    /// RGBA color for cursor/selection rendering, derived from the id so
    /// every client renders the same participant in the same color.
    pub color: [f32; 4],
}

impl Participant {
    pub fn new(id: Uuid, display_name: impl Into<String>) -> Self {
        Self {
            id,
            display_name: display_name.into(),
            color: color_from_id(id),
        }
    }
}

/// Stable color from a participant id hash.
fn color_from_id(id: Uuid) -> [f32; 4] {
    let hash = id.as_u128();
    let r = (hash & 0xFF) as f32 / 255.0;
    let g = ((hash >> 8) & 0xFF) as f32 / 255.0;
    let b = ((hash >> 16) & 0xFF) as f32 / 255.0;
    [r, g, b, 1.0]
}

/// Worker-side state for one participant.
struct Member {
    participant: Participant,
    last_seen: Instant,
    cursor: Cursor,
    last_acked: u64,
}

/// Presence roster for one document session.
#[derive(Default)]
pub struct Roster {
    members: HashMap<Uuid, Member>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or refresh) a participant. Returns true if they were new.
    pub fn join(&mut self, participant: Participant, now: Instant) -> bool {
        match self.members.get_mut(&participant.id) {
            Some(member) => {
                // Reconnect under the same identity: keep cursor and ack.
                member.participant = participant;
                member.last_seen = now;
                false
            }
            None => {
                self.members.insert(
                    participant.id,
                    Member {
                        participant,
                        last_seen: now,
                        cursor: Cursor::default(),
                        last_acked: 0,
                    },
                );
                true
            }
        }
    }

    pub fn leave(&mut self, id: Uuid) -> Option<Participant> {
        self.members.remove(&id).map(|m| m.participant)
    }

    pub fn heartbeat(&mut self, id: Uuid, now: Instant) -> bool {
        match self.members.get_mut(&id) {
            Some(member) => {
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn update_cursor(&mut self, id: Uuid, cursor: Cursor, now: Instant) -> bool {
        match self.members.get_mut(&id) {
            Some(member) => {
                member.cursor = cursor;
                member.last_seen = now;
                true
            }
            None => false,
        }
    }

    /// Record the highest log position the client is known to have applied.
    pub fn ack(&mut self, id: Uuid, position: u64) {
        if let Some(member) = self.members.get_mut(&id) {
            member.last_acked = member.last_acked.max(position);
        }
    }

    /// Lowest acknowledged position across the roster (compaction floor).
    pub fn min_acked(&self) -> Option<u64> {
        self.members.values().map(|m| m.last_acked).min()
    }

    /// Remove everyone whose last heartbeat is older than `timeout`.
    pub fn sweep_timeouts(&mut self, now: Instant, timeout: Duration) -> Vec<Participant> {
        let stale: Vec<Uuid> = self
            .members
            .iter()
            .filter(|(_, m)| now.duration_since(m.last_seen) >= timeout)
            .map(|(id, _)| *id)
            .collect();

        stale
            .into_iter()
            .filter_map(|id| self.leave(id))
            .collect()
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.members.contains_key(&id)
    }

    pub fn participants(&self) -> Vec<Participant> {
        self.members.values().map(|m| m.participant.clone()).collect()
    }

    pub fn cursors(&self) -> Vec<(Uuid, Cursor)> {
        self.members
            .iter()
            .map(|(id, m)| (*id, m.cursor))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Identity failures.
#[derive(Debug, Clone)]
pub enum IdentityError {
    UnknownToken,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::UnknownToken => write!(f, "token does not resolve to a participant"),
        }
    }
}

impl std::error::Error for IdentityError {}

/// Identity collaborator: maps an opaque token to a stable participant.
pub trait IdentityProvider: Send + Sync {
    fn resolve_participant(&self, token: &str) -> Result<Participant, IdentityError>;
}

/// Token registry backed by a fixed map. Production deployments plug in
/// their own provider; tests and the demo server register tokens up front.
#[derive(Default)]
pub struct StaticIdentity {
    participants: std::sync::RwLock<HashMap<String, Participant>>,
}

impl StaticIdentity {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, token: impl Into<String>, participant: Participant) {
        if let Ok(mut map) = self.participants.write() {
            map.insert(token.into(), participant);
        }
    }
}

impl IdentityProvider for StaticIdentity {
    fn resolve_participant(&self, token: &str) -> Result<Participant, IdentityError> {
        self.participants
            .read()
            .ok()
            .and_then(|map| map.get(token).cloned())
            .ok_or(IdentityError::UnknownToken)
    }
}
