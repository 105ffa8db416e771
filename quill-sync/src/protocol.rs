//! Binary wire protocol for the WebSocket transport.
//!
//! Two bincode-encoded enums cross the socket: [`ClientRequest`] upstream
//! and [`ServerMessage`] downstream. The first request on a connection
//! must be `Join`; everything after it acts on the joined session. This
//! is one conforming transport over the engine interface, not a mandated
//! public format — any ordered request/event transport would do.
//!
//! ```text
//! ┌────────┐  ClientRequest (bincode)  ┌────────┐  commands  ┌────────┐
//! │ client │ ─────────────────────────►│ server │ ──────────►│ engine │
//! │        │ ◄───────────────────────── │        │ ◄────────── │        │
//! └────────┘  ServerMessage (bincode)  └────────┘   events   └────────┘
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broadcast::DocEvent;
use crate::locks::{ConflictRecord, LockSummary};
use crate::operation::{Cursor, LogEntry, Operation};
use crate::session::Participant;

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    SerializationError(String),
    DeserializationError(String),
    ConnectionClosed,
    /// A request other than `Join` arrived before the session existed.
    NotJoined,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SerializationError(e) => write!(f, "serialization error: {e}"),
            Self::DeserializationError(e) => write!(f, "deserialization error: {e}"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::NotJoined => write!(f, "request before join"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Requests a client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Authenticate and enter a document session. Must come first.
    Join { token: String, doc_id: Uuid },
    /// Submit an operation for sequencing.
    Submit { op: Operation },
    /// Acquire an exclusive range; `ttl_ms = None` uses the server default.
    AcquireLock {
        start: usize,
        end: usize,
        ttl_ms: Option<u64>,
    },
    ReleaseLock { start: usize, end: usize },
    RenewLock { start: usize, end: usize },
    /// Cursor/selection update (high frequency, lossy).
    Cursor { cursor: Cursor },
    /// Liveness signal.
    Heartbeat,
    /// Highest log position this client has applied.
    Ack { position: u64 },
    /// Accept or reject a pending conflict.
    ResolveConflict { conflict_id: Uuid, accept: bool },
    /// Request replay of entries at or after `since` (reconnect).
    CatchUp { since: u64 },
}

/// Result of a submission, as reported to the submitting client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitReply {
    Appended { position: u64 },
    Rejected { record: ConflictRecord },
    /// Document queue full; retry with backoff.
    Backpressured,
    /// Base position no longer retained; refetch a snapshot.
    Stale { earliest: u64 },
}

/// Messages the server sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerMessage {
    /// Join succeeded: the full state needed to render the document.
    Joined {
        participant: Participant,
        position: u64,
        text: String,
        locks: Vec<LockSummary>,
        presence: Vec<Participant>,
    },
    /// Outcome of this client's submission, keyed by its op id.
    SubmitResult {
        client_op_id: Uuid,
        reply: SubmitReply,
    },
    /// Lock acquired for this client.
    LockGranted { lock: LockSummary },
    /// Lock acquisition failed against an existing foreign lock.
    LockDenied { existing: LockSummary },
    /// A broadcast session event (operations, cursors, locks, presence).
    Event(DocEvent),
    /// Replayed entries for a `CatchUp` request, in log order.
    CaughtUp { entries: Vec<LogEntry> },
    /// Conflict resolution outcome; `applied` is the position when the
    /// operation was accepted and landed.
    ConflictResolved {
        conflict_id: Uuid,
        applied: Option<u64>,
    },
    /// The subscriber lagged and must catch up before trusting the stream.
    Lagged { missed: u64 },
    /// Request-level failure, human-readable.
    Error { message: String },
}

impl ClientRequest {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

impl ServerMessage {
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::DeserializationError(e.to_string()))?;
        Ok(msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Span;

    #[test]
    fn test_join_roundtrip() {
        let req = ClientRequest::Join {
            token: "token-alice".into(),
            doc_id: Uuid::new_v4(),
        };
        let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
        assert_eq!(decoded, req);
    }

    #[test]
    fn test_submit_roundtrip() {
        let op = Operation::replace(Uuid::new_v4(), 9, 2, 5, "xyz");
        let req = ClientRequest::Submit { op: op.clone() };
        match ClientRequest::decode(&req.encode().unwrap()).unwrap() {
            ClientRequest::Submit { op: decoded } => assert_eq!(decoded, op),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_lock_requests_roundtrip() {
        for req in [
            ClientRequest::AcquireLock {
                start: 1,
                end: 9,
                ttl_ms: Some(5000),
            },
            ClientRequest::ReleaseLock { start: 1, end: 9 },
            ClientRequest::RenewLock { start: 1, end: 9 },
        ] {
            let decoded = ClientRequest::decode(&req.encode().unwrap()).unwrap();
            assert_eq!(decoded, req);
        }
    }

    #[test]
    fn test_joined_roundtrip() {
        let msg = ServerMessage::Joined {
            participant: Participant::new(Uuid::new_v4(), "Alice"),
            position: 17,
            text: "contents".into(),
            locks: vec![LockSummary {
                start: 0,
                end: 4,
                owner: Uuid::new_v4(),
            }],
            presence: vec![Participant::new(Uuid::new_v4(), "Bob")],
        };
        let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_event_roundtrip() {
        let entry = LogEntry {
            position: 3,
            origin: Uuid::new_v4(),
            client_op_id: Uuid::new_v4(),
            span: Span::new(0, 2, "ab"),
        };
        let msg = ServerMessage::Event(DocEvent::OperationApplied(entry.clone()));
        match ServerMessage::decode(&msg.encode().unwrap()).unwrap() {
            ServerMessage::Event(DocEvent::OperationApplied(decoded)) => {
                assert_eq!(decoded, entry);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_submit_reply_variants_roundtrip() {
        let op = Operation::insert(Uuid::new_v4(), 0, 0, "x");
        let record = ConflictRecord::new(
            op,
            LockSummary {
                start: 0,
                end: 3,
                owner: Uuid::new_v4(),
            },
        );
        for reply in [
            SubmitReply::Appended { position: 4 },
            SubmitReply::Rejected { record },
            SubmitReply::Backpressured,
            SubmitReply::Stale { earliest: 12 },
        ] {
            let msg = ServerMessage::SubmitResult {
                client_op_id: Uuid::new_v4(),
                reply: reply.clone(),
            };
            let decoded = ServerMessage::decode(&msg.encode().unwrap()).unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(ClientRequest::decode(&[0xFF, 0xFE, 0xFD]).is_err());
        assert!(ServerMessage::decode(&[0xFF]).is_err());
    }

    #[test]
    fn test_small_message_stays_small() {
        let req = ClientRequest::Heartbeat;
        assert!(req.encode().unwrap().len() < 8);

        let ack = ClientRequest::Ack { position: 123 };
        assert!(ack.encode().unwrap().len() < 16);
    }
}
