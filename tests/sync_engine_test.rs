//! Integration tests for the synchronization engine.
//!
//! Replicas are driven directly through the engine, without a socket, to
//! check snapshot-then-broadcast ordering, unicast lookups, rejection of bad
//! input, fan-out isolation and checkpointing.

use async_trait::async_trait;
use clap::Parser;
use lww_sync::config::Config;
use lww_sync::protocol::ServerEvent;
use lww_sync::server::open_engine;
use lww_sync::{
    EngineConfig, FileSnapshotStore, MemorySnapshotStore, ProtocolError, ReplicaState,
    ServerMessage, Snapshot, SnapshotStore, StoreError, SyncEngine, SyncError, Timestamp,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

fn memory_engine() -> (Arc<SyncEngine>, Arc<MemorySnapshotStore>) {
    let store = Arc::new(MemorySnapshotStore::new());
    let engine = SyncEngine::new(store.clone(), EngineConfig::default());
    (Arc::new(engine), store)
}

fn broadcast_timestamp(message: &ServerMessage) -> Timestamp {
    match message {
        ServerMessage::Event(ServerEvent::Add { timestamp, .. })
        | ServerMessage::Event(ServerEvent::Remove { timestamp, .. }) => *timestamp,
        other => panic!("expected a broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_late_joiner_gets_snapshot_not_history() {
    let (engine, _store) = memory_engine();
    let mut a = engine.connect().await;
    let mut b = engine.connect().await;
    assert_eq!(a.try_recv(), Some(ServerMessage::initial_data(BTreeMap::new())));
    assert_eq!(b.try_recv(), Some(ServerMessage::initial_data(BTreeMap::new())));

    engine
        .handle(a.id(), r#"{"action":"add","key":"x","value":"1"}"#)
        .await
        .unwrap();

    // Both connected replicas, originator included, see the same broadcast
    let seen_by_a = a.try_recv().unwrap();
    let seen_by_b = b.try_recv().unwrap();
    assert_eq!(seen_by_a, seen_by_b);
    let t1 = broadcast_timestamp(&seen_by_b);
    assert_eq!(seen_by_b, ServerMessage::added("x".into(), json!("1"), t1));

    engine
        .handle(b.id(), r#"{"action":"lookup","key":"x"}"#)
        .await
        .unwrap();
    assert_eq!(b.try_recv(), Some(ServerMessage::lookup("x".into(), Some(json!("1")))));
    // Lookups are never broadcast
    assert_eq!(a.try_recv(), None);

    let mut c = engine.connect().await;
    assert_eq!(
        c.try_recv(),
        Some(ServerMessage::initial_data(BTreeMap::from([(
            "x".to_string(),
            json!("1")
        )])))
    );
    assert_eq!(c.try_recv(), None);
}

#[tokio::test]
async fn test_remove_broadcasts_null_value() {
    let (engine, _store) = memory_engine();
    let mut replica = engine.connect().await;
    replica.try_recv();

    let added = engine.add("k".into(), json!({"n": 1})).await;
    let removed = engine.remove("k".into()).await;
    assert!(removed > added);

    replica.try_recv();
    assert_eq!(
        replica.try_recv(),
        Some(ServerMessage::removed("k".into(), removed))
    );
    assert_eq!(engine.lookup("k"), None);
}

#[tokio::test]
async fn test_broadcasts_share_one_total_order() {
    let (engine, _store) = memory_engine();
    let mut replicas = Vec::new();
    for _ in 0..3 {
        let mut replica = engine.connect().await;
        replica.try_recv();
        replicas.push(replica);
    }

    let writers: Vec<_> = (0..20)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let id = replicas[i % 3].id();
            tokio::spawn(async move {
                let text = format!(r#"{{"action":"add","key":"k{}","value":{}}}"#, i % 4, i);
                engine.handle(id, &text).await.unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.await.unwrap();
    }

    let mut streams = Vec::new();
    for replica in &mut replicas {
        let mut stream = Vec::new();
        while let Some(message) = replica.try_recv() {
            stream.push(message);
        }
        streams.push(stream);
    }

    assert_eq!(streams[0].len(), 20);
    assert!(streams.windows(2).all(|w| w[0] == w[1]));
    let stamps: Vec<_> = streams[0].iter().map(broadcast_timestamp).collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn test_malformed_message_is_rejected_without_broadcast() {
    let (engine, store) = memory_engine();
    let mut sender = engine.connect().await;
    let mut other = engine.connect().await;
    sender.try_recv();
    other.try_recv();

    let err = engine
        .handle(sender.id(), r#"{"action":"add","value":"no key"}"#)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Protocol(ProtocolError::Malformed(_))));

    let err = engine
        .handle(sender.id(), r#"{"action":"explode","key":"x"}"#)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        SyncError::Protocol(ProtocolError::UnknownAction("explode".into()))
    );

    // The sender hears about each rejection, nobody else does
    assert!(matches!(
        sender.try_recv(),
        Some(ServerMessage::Event(ServerEvent::Error { .. }))
    ));
    assert!(matches!(
        sender.try_recv(),
        Some(ServerMessage::Event(ServerEvent::Error { .. }))
    ));
    assert_eq!(other.try_recv(), None);
    assert_eq!(store.save_count(), 0);
    assert_eq!(engine.state_of(sender.id()), ReplicaState::Synced);
}

#[tokio::test]
async fn test_closed_replica_cannot_send() {
    let (engine, _store) = memory_engine();
    let replica = engine.connect().await;
    engine.disconnect(replica.id());

    let err = engine
        .handle(replica.id(), r#"{"action":"lookup","key":"x"}"#)
        .await
        .unwrap_err();
    assert_eq!(err, SyncError::UnknownReplica(replica.id()));
    assert_eq!(engine.state_of(replica.id()), ReplicaState::Closed);
}

#[tokio::test]
async fn test_dropped_receiver_is_evicted_without_affecting_others() {
    let (engine, _store) = memory_engine();
    let gone = engine.connect().await;
    let gone_id = gone.id();
    let mut alive = engine.connect().await;
    alive.try_recv();
    drop(gone);

    engine.add("k".into(), json!(true)).await;

    assert!(alive.try_recv().is_some());
    assert_eq!(engine.state_of(gone_id), ReplicaState::Closed);
    assert_eq!(engine.replica_count(), 1);
}

#[tokio::test]
async fn test_unresponsive_replica_does_not_block_writers() {
    let store = Arc::new(MemorySnapshotStore::new());
    let engine = Arc::new(SyncEngine::new(
        store,
        EngineConfig {
            replica_buffer: 2,
            ..EngineConfig::default()
        },
    ));
    let stalled = engine.connect().await;
    let mut writer = engine.connect().await;
    writer.try_recv();

    for i in 0..10 {
        engine
            .handle(writer.id(), &format!(r#"{{"action":"add","key":"k","value":{i}}}"#))
            .await
            .unwrap();
        assert!(writer.try_recv().is_some(), "write {i} not delivered");
    }

    assert_eq!(engine.lookup("k"), Some(json!(9)));
    assert_eq!(engine.state_of(stalled.id()), ReplicaState::Closed);
}

/// Store whose saves wait until the test releases them.
struct GatedStore {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl SnapshotStore for GatedStore {
    async fn save(&self, _snapshot: &Snapshot) -> Result<(), StoreError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(Snapshot::empty())
    }

    fn describe(&self) -> String {
        "gated".to_string()
    }
}

#[tokio::test]
async fn test_disconnecting_writer_update_still_delivered() {
    let store = Arc::new(GatedStore {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = Arc::new(SyncEngine::new(store.clone(), EngineConfig::default()));
    let writer = engine.connect().await;
    let mut reader = engine.connect().await;
    reader.try_recv();

    let writer_id = writer.id();
    let task = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move {
            engine
                .handle(writer_id, r#"{"action":"add","key":"last","value":"words"}"#)
                .await
        })
    };

    // The add is applied and waiting on its checkpoint when the writer leaves
    store.entered.notified().await;
    drop(writer);
    engine.disconnect(writer_id);
    store.release.notify_one();
    task.await.unwrap().unwrap();

    assert_eq!(engine.lookup("last"), Some(json!("words")));
    assert!(matches!(
        reader.try_recv(),
        Some(ServerMessage::Event(ServerEvent::Add { .. }))
    ));
    assert_eq!(engine.replica_count(), 1);
}

#[tokio::test]
async fn test_every_mutation_is_checkpointed() {
    let (engine, store) = memory_engine();

    engine.add("a".into(), json!(1)).await;
    engine.add("b".into(), json!(2)).await;
    engine.remove("a".into()).await;

    assert_eq!(store.save_count(), 3);
    let saved = store.saved().unwrap();
    assert_eq!(saved.projection(), engine.projection());
    // Tombstones are persisted too
    assert!(saved.elements["a"].removed_at.is_some());
}

#[tokio::test]
async fn test_persistence_failures_degrade_but_keep_serving() {
    let (engine, store) = memory_engine();
    let mut replica = engine.connect().await;
    replica.try_recv();
    store.set_fail_writes(true);

    for i in 0..3 {
        engine.add(format!("k{i}"), json!(i)).await;
        assert!(replica.try_recv().is_some());
    }

    let health = engine.persistence();
    assert_eq!(health.consecutive_failures, 3);
    assert!(health.degraded);
    assert_eq!(engine.projection().len(), 3);

    store.set_fail_writes(false);
    engine.add("k3".into(), json!(3)).await;
    assert_eq!(engine.persistence().consecutive_failures, 0);
    assert!(!engine.persistence().degraded);
    assert_eq!(store.saved().unwrap().projection().len(), 4);
}

#[tokio::test]
async fn test_restart_preserves_last_write_wins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let before = {
        let store = Arc::new(FileSnapshotStore::new(&path));
        let engine = SyncEngine::restore(store, EngineConfig::default())
            .await
            .unwrap();
        engine.add("kept".into(), json!("v1")).await;
        engine.add("gone".into(), json!("v1")).await;
        engine.remove("gone".into()).await
    };

    let store = Arc::new(FileSnapshotStore::new(&path));
    let engine = SyncEngine::restore(store, EngineConfig::default())
        .await
        .unwrap();

    assert_eq!(engine.lookup("kept"), Some(json!("v1")));
    assert_eq!(engine.lookup("gone"), None);

    // A stale write stamped before the restart cannot resurrect the key
    let restored = engine.dictionary().element(&"gone".to_string()).unwrap();
    assert_eq!(restored.removed_at, Some(before));
    engine
        .dictionary()
        .add("gone".into(), json!("stale"), Timestamp::from_raw(before.value() - 1));
    assert_eq!(engine.lookup("gone"), None);

    // New writes outrank everything restored
    assert!(engine.add("gone".into(), json!("v2")).await > before);
    assert_eq!(engine.lookup("gone"), Some(json!("v2")));
}

#[tokio::test]
async fn test_open_engine_quarantines_corrupt_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, b"{ not json").unwrap();
    let config = Config::parse_from([
        "lww-sync",
        "--snapshot-path",
        path.to_str().unwrap(),
    ]);

    let engine = open_engine(&config).await.unwrap();

    assert!(engine.projection().is_empty());
    assert!(dir.path().join("state.json.corrupt").exists());

    engine.add("fresh".into(), json!(1)).await;
    let reloaded = FileSnapshotStore::new(&path).load().await.unwrap();
    assert_eq!(reloaded.projection().len(), 1);
}

#[tokio::test]
async fn test_restore_from_memory_snapshot() {
    let dict = lww_sync::LwwDictionary::new();
    dict.add("seed".to_string(), json!([1, 2, 3]), Timestamp::from_raw(42));
    let store = Arc::new(MemorySnapshotStore::with_snapshot(Snapshot::of(&dict)));

    let engine = SyncEngine::restore(store, EngineConfig::default())
        .await
        .unwrap();
    let mut replica = engine.connect().await;

    assert_eq!(
        replica.try_recv(),
        Some(ServerMessage::initial_data(BTreeMap::from([(
            "seed".to_string(),
            json!([1, 2, 3])
        )])))
    );
}

#[tokio::test]
async fn test_far_future_snapshot_cannot_pin_the_clock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");
    let doc = json!({
        "version": 1,
        "elements": {"k": {"add": null, "removed_at": u64::MAX}}
    });
    std::fs::write(&path, doc.to_string()).unwrap();
    let config = Config::parse_from([
        "lww-sync",
        "--snapshot-path",
        path.to_str().unwrap(),
    ]);

    let engine = open_engine(&config).await.unwrap();
    assert!(dir.path().join("state.json.corrupt").exists());

    let t1 = engine.add("k".into(), json!("visible")).await;
    let t2 = engine.add("k".into(), json!("again")).await;
    assert!(t1 < t2);
    assert_eq!(engine.lookup("k"), Some(json!("again")));
}

/// A store whose saves never complete.
struct StalledStore;

#[async_trait]
impl SnapshotStore for StalledStore {
    async fn save(&self, _snapshot: &Snapshot) -> Result<(), StoreError> {
        std::future::pending().await
    }

    async fn load(&self) -> Result<Snapshot, StoreError> {
        Ok(Snapshot::empty())
    }

    fn describe(&self) -> String {
        "stalled".to_string()
    }
}

#[tokio::test]
async fn test_stalled_store_does_not_hold_up_other_replicas() {
    let engine = Arc::new(SyncEngine::new(
        Arc::new(StalledStore),
        EngineConfig {
            persist_timeout: Duration::from_millis(50),
            ..EngineConfig::default()
        },
    ));
    let mut watcher = engine.connect().await;
    watcher.try_recv();

    let pending_add = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.add("k".into(), json!(1)).await })
    };
    // Let the add take the writer lock and stall inside its checkpoint
    tokio::task::yield_now().await;

    let mut late = timeout(Duration::from_secs(2), engine.connect())
        .await
        .expect("connect stayed blocked behind a stalled checkpoint");
    timeout(Duration::from_secs(2), engine.remove("other".into()))
        .await
        .expect("remove stayed blocked behind a stalled checkpoint");
    pending_add.await.unwrap();

    // Mutations are still applied and broadcast while the store is stuck
    assert_eq!(engine.lookup("k"), Some(json!(1)));
    assert!(matches!(
        watcher.try_recv(),
        Some(ServerMessage::Event(ServerEvent::Add { .. }))
    ));
    assert!(matches!(
        late.try_recv(),
        Some(ServerMessage::Event(ServerEvent::InitialData { .. }))
    ));
    assert_eq!(engine.persistence().consecutive_failures, 2);
}

#[tokio::test]
async fn test_replica_is_connecting_until_synced() {
    let store = Arc::new(GatedStore {
        entered: Notify::new(),
        release: Notify::new(),
    });
    let engine = Arc::new(SyncEngine::new(store.clone(), EngineConfig::default()));

    // Hold the writer lock inside a checkpoint
    let writer = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.add("x".into(), json!("1")).await })
    };
    store.entered.notified().await;

    let id = engine.open_replica();
    assert_eq!(engine.state_of(id), ReplicaState::Connecting);

    let syncing = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.sync_replica(id).await })
    };
    tokio::task::yield_now().await;
    assert_eq!(engine.state_of(id), ReplicaState::Connecting);

    store.release.notify_one();
    writer.await.unwrap();
    let mut replica = syncing.await.unwrap().unwrap();

    assert_eq!(engine.state_of(id), ReplicaState::Synced);
    // The add finished before the snapshot was taken, so it is not replayed
    assert_eq!(
        replica.try_recv(),
        Some(ServerMessage::initial_data(BTreeMap::from([(
            "x".to_string(),
            json!("1")
        )])))
    );
    assert_eq!(replica.try_recv(), None);
}

#[tokio::test]
async fn test_connecting_replica_can_be_abandoned() {
    let (engine, _store) = memory_engine();
    let id = engine.open_replica();

    engine.disconnect(id);

    assert_eq!(engine.state_of(id), ReplicaState::Closed);
    assert_eq!(
        engine.sync_replica(id).await.err(),
        Some(SyncError::UnknownReplica(id))
    );
}
