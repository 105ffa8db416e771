//! Persistence integration tests: documents survive engine restarts and
//! full process handoffs through the RocksDB store.

use std::sync::Arc;
use std::time::Duration;

use quill_sync::engine::{CollabEngine, EngineConfig, SubmitStatus};
use quill_sync::operation::Operation;
use quill_sync::session::Participant;
use quill_sync::storage::{DocumentStore, SnapshotStore, StoreConfig};
use tempfile::tempdir;
use uuid::Uuid;

fn someone(name: &str) -> Participant {
    Participant::new(Uuid::new_v4(), name)
}

async fn appended(engine: &CollabEngine, handle: quill_sync::SessionHandle, op: Operation) -> u64 {
    match engine.submit(handle, op).await.unwrap() {
        SubmitStatus::Appended(position) => position,
        other => panic!("expected appended, got {other:?}"),
    }
}

/// Wait until the engine has no live workers (grace expiry), so the store
/// is fully released before a reopen.
async fn drain_engine(engine: &CollabEngine) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while engine.active_documents().await > 0 {
        if tokio::time::Instant::now() > deadline {
            panic!("workers never drained");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    // The exiting worker still holds its store Arc for a beat.
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_document_survives_engine_restart_on_rocksdb() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Uuid::new_v4();
    let alice = someone("Alice");

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let engine = CollabEngine::new(EngineConfig::for_testing(), store);
        let (handle, _, _stream) = engine.join(doc, alice.clone()).await.unwrap();
        appended(&engine, handle, Operation::insert(alice.id, 0, 0, "durable")).await;
        appended(&engine, handle, Operation::insert(alice.id, 1, 7, " state")).await;
        engine.leave(handle).await;
        drain_engine(&engine).await;
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let engine = CollabEngine::new(EngineConfig::for_testing(), store);
    let (_, state, _) = engine.join(doc, alice).await.unwrap();
    assert_eq!(state.text, "durable state");
    assert_eq!(state.position, 2);
}

#[tokio::test]
async fn test_restart_replays_snapshot_plus_tail() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Uuid::new_v4();
    let alice = someone("Alice");

    // A long persist interval keeps the snapshot behind the head, so the
    // reopen must replay the stored entry tail to recover everything.
    let config = EngineConfig {
        persist_interval: Duration::from_secs(3600),
        ..EngineConfig::for_testing()
    };

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let engine = CollabEngine::new(config.clone(), store);
        let (handle, _, _stream) = engine.join(doc, alice.clone()).await.unwrap();
        for (i, word) in ["a", "b", "c", "d"].iter().enumerate() {
            appended(
                &engine,
                handle,
                Operation::insert(alice.id, i as u64, i, *word),
            )
            .await;
        }
        engine.leave(handle).await;
        drain_engine(&engine).await;
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());

    // The shutdown snapshot is allowed, but the entry tail alone must
    // reconstruct the same state; verify the store contents directly.
    let snapshot = store.load_document(doc).unwrap();
    let base = snapshot.as_ref().map(|s| s.position).unwrap_or(0);
    let tail = store.entries_since(doc, base).unwrap();
    let mut text = snapshot.map(|s| s.text).unwrap_or_default();
    for entry in &tail {
        text = quill_sync::apply(&text, &entry.span);
    }
    assert_eq!(text, "abcd");

    let engine = CollabEngine::new(config, store);
    let (_, state, _) = engine.join(doc, alice).await.unwrap();
    assert_eq!(state.text, "abcd");
    assert_eq!(state.position, 4);
}

#[tokio::test]
async fn test_dedup_survives_restart() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Uuid::new_v4();
    let alice = someone("Alice");
    let op = Operation::insert(alice.id, 0, 0, "exactly once");

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let engine = CollabEngine::new(EngineConfig::for_testing(), store);
        let (handle, _, _stream) = engine.join(doc, alice.clone()).await.unwrap();
        appended(&engine, handle, op.clone()).await;
        engine.leave(handle).await;
        drain_engine(&engine).await;
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    let engine = CollabEngine::new(EngineConfig::for_testing(), store);
    let (handle, _, _stream) = engine.join(doc, alice.clone()).await.unwrap();

    // The same client op id after a full restart is still one entry.
    let position = appended(&engine, handle, op).await;
    assert_eq!(position, 0);

    let entries = engine.catch_up(handle, 0).await.unwrap();
    assert_eq!(entries.len(), 1);

    let (_, state, _) = engine.join(doc, alice).await.unwrap();
    assert_eq!(state.text, "exactly once");
}

#[tokio::test]
async fn test_multiple_documents_isolated_in_store() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let alice = someone("Alice");
    let doc_a = Uuid::new_v4();
    let doc_b = Uuid::new_v4();

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let engine = CollabEngine::new(EngineConfig::for_testing(), store);
        let (ha, _, _sa) = engine.join(doc_a, alice.clone()).await.unwrap();
        let (hb, _, _sb) = engine.join(doc_b, alice.clone()).await.unwrap();
        appended(&engine, ha, Operation::insert(alice.id, 0, 0, "first")).await;
        appended(&engine, hb, Operation::insert(alice.id, 0, 0, "second")).await;
        engine.leave(ha).await;
        engine.leave(hb).await;
        drain_engine(&engine).await;
    }

    let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
    assert_eq!(store.list_documents().unwrap().len(), 2);

    let engine = CollabEngine::new(EngineConfig::for_testing(), store);
    let (_, state_a, _) = engine.join(doc_a, alice.clone()).await.unwrap();
    let (_, state_b, _) = engine.join(doc_b, alice).await.unwrap();
    assert_eq!(state_a.text, "first");
    assert_eq!(state_b.text, "second");
}

#[tokio::test]
async fn test_snapshot_prunes_entry_tail() {
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("db");
    let doc = Uuid::new_v4();
    let alice = someone("Alice");

    {
        let store = Arc::new(DocumentStore::open(StoreConfig::for_testing(&db_path)).unwrap());
        let engine = CollabEngine::new(EngineConfig::for_testing(), store.clone());
        let (handle, _, _stream) = engine.join(doc, alice.clone()).await.unwrap();
        for i in 0..12 {
            appended(&engine, handle, Operation::insert(alice.id, i, 0, "x")).await;
        }
        engine.leave(handle).await;
        drain_engine(&engine).await;

        // The shutdown snapshot covers the whole log, so the tail is gone.
        let snapshot = store.load_document(doc).unwrap().unwrap();
        assert_eq!(snapshot.position, 12);
        assert!(store.entries_since(doc, 0).unwrap().is_empty());
    }
}
