//! Fan-out of document events to every subscriber in log order.
//!
//! Built on tokio broadcast channels: one channel per document, one
//! receiver per subscriber, O(1) send to all. Events are emitted by the
//! single document worker *after* the state change they describe, so a
//! subscriber can never observe a cursor or lock event before the
//! operation it causally depends on, and `OperationApplied` events arrive
//! in exactly log order.
//!
//! A subscriber that falls more than `capacity` events behind observes an
//! explicit [`StreamError::Lagged`] and must catch up from the log
//! (`entries_since(last_acked)`) before resubscribing — the gap is never
//! papered over silently.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::locks::{ConflictRecord, LockSummary};
use crate::operation::{Cursor, LogEntry};
use crate::session::Participant;

/// Everything a subscriber can observe about a document session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DocEvent {
    /// An operation was accepted and appended at its position.
    OperationApplied(LogEntry),
    /// A participant moved their cursor or changed their selection.
    CursorMoved {
        participant_id: Uuid,
        cursor: Cursor,
    },
    /// A lock was acquired (`released == false`) or went away.
    LockChanged { lock: LockSummary, released: bool },
    /// An operation was rejected against a foreign lock.
    ConflictRaised(ConflictRecord),
    /// A participant joined the session.
    ParticipantJoined(Participant),
    /// A participant left, timed out, or disconnected.
    ParticipantLeft(Uuid),
}

/// Errors surfaced by [`EventStream::recv`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    /// The subscriber fell behind and `missed` events were dropped.
    /// Catch up via the log before resubscribing.
    Lagged(u64),
    /// The document worker is gone; no further events will arrive.
    Closed,
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Lagged(missed) => write!(f, "subscriber lagged by {missed} events"),
            StreamError::Closed => write!(f, "event stream closed"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Subscriber end of a document's event fan.
pub struct EventStream {
    rx: broadcast::Receiver<Arc<DocEvent>>,
}

impl EventStream {
    /// Next event, in emission order.
    pub async fn recv(&mut self) -> Result<Arc<DocEvent>, StreamError> {
        match self.rx.recv().await {
            Ok(event) => Ok(event),
            Err(broadcast::error::RecvError::Lagged(n)) => Err(StreamError::Lagged(n)),
            Err(broadcast::error::RecvError::Closed) => Err(StreamError::Closed),
        }
    }

    /// Non-blocking variant; `Ok(None)` when no event is ready.
    pub fn try_recv(&mut self) -> Result<Option<Arc<DocEvent>>, StreamError> {
        match self.rx.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(broadcast::error::TryRecvError::Empty) => Ok(None),
            Err(broadcast::error::TryRecvError::Lagged(n)) => Err(StreamError::Lagged(n)),
            Err(broadcast::error::TryRecvError::Closed) => Err(StreamError::Closed),
        }
    }
}

/// Fan statistics, tracked with atomics so emit never takes a lock.
#[derive(Debug, Clone, Default)]
pub struct FanStats {
    pub events_emitted: u64,
    pub subscribers: usize,
}

/// Per-document event fan.
pub struct EventFan {
    sender: broadcast::Sender<Arc<DocEvent>>,
    capacity: usize,
    emitted: AtomicU64,
}

impl EventFan {
    /// `capacity` is the number of events buffered per subscriber before
    /// a slow one starts lagging.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            capacity,
            emitted: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.sender.subscribe(),
        }
    }

    /// Emit to all current subscribers; returns how many received it.
    pub fn emit(&self, event: DocEvent) -> usize {
        let count = self.sender.send(Arc::new(event)).unwrap_or(0);
        self.emitted.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> FanStats {
        FanStats {
            events_emitted: self.emitted.load(Ordering::Relaxed),
            subscribers: self.sender.receiver_count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Span;

    fn entry(position: u64) -> LogEntry {
        LogEntry {
            position,
            origin: Uuid::new_v4(),
            client_op_id: Uuid::new_v4(),
            span: Span::new(0, 0, "x"),
        }
    }

    #[tokio::test]
    async fn test_fan_out_to_all_subscribers() {
        let fan = EventFan::new(16);
        let mut a = fan.subscribe();
        let mut b = fan.subscribe();
        let mut c = fan.subscribe();

        let count = fan.emit(DocEvent::OperationApplied(entry(0)));
        assert_eq!(count, 3);

        for rx in [&mut a, &mut b, &mut c] {
            match rx.recv().await.unwrap().as_ref() {
                DocEvent::OperationApplied(e) => assert_eq!(e.position, 0),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_events_arrive_in_emission_order() {
        let fan = EventFan::new(64);
        let mut rx = fan.subscribe();

        for i in 0..10 {
            fan.emit(DocEvent::OperationApplied(entry(i)));
        }

        let mut last = None;
        for _ in 0..10 {
            if let DocEvent::OperationApplied(e) = rx.recv().await.unwrap().as_ref() {
                if let Some(prev) = last {
                    assert_eq!(e.position, prev + 1, "gap or reorder in stream");
                }
                last = Some(e.position);
            }
        }
        assert_eq!(last, Some(9));
    }

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let fan = EventFan::new(16);
        assert_eq!(fan.emit(DocEvent::ParticipantLeft(Uuid::new_v4())), 0);
        assert_eq!(fan.stats().events_emitted, 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_sees_explicit_gap() {
        let fan = EventFan::new(4);
        let mut rx = fan.subscribe();

        for i in 0..10 {
            fan.emit(DocEvent::OperationApplied(entry(i)));
        }

        match rx.recv().await {
            Err(StreamError::Lagged(missed)) => assert!(missed > 0),
            other => panic!("expected lag error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_after_fan_dropped() {
        let fan = EventFan::new(16);
        let mut rx = fan.subscribe();
        drop(fan);
        assert_eq!(rx.recv().await.unwrap_err(), StreamError::Closed);
    }

    #[tokio::test]
    async fn test_try_recv() {
        let fan = EventFan::new(16);
        let mut rx = fan.subscribe();

        assert_eq!(rx.try_recv().unwrap(), None);
        fan.emit(DocEvent::ParticipantLeft(Uuid::new_v4()));
        assert!(rx.try_recv().unwrap().is_some());
        assert_eq!(rx.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_subscriber_count_tracks_drops() {
        let fan = EventFan::new(16);
        let a = fan.subscribe();
        let _b = fan.subscribe();
        assert_eq!(fan.subscriber_count(), 2);
        drop(a);
        assert_eq!(fan.subscriber_count(), 1);
        assert_eq!(fan.capacity(), 16);
    }
}
