//! Synchronization engine.
//!
//! The engine owns the single authoritative dictionary. It stamps every
//! mutation with the shared clock, applies it, checkpoints the result and
//! broadcasts it to every connected replica in the order applied. Joining
//! replicas receive the full visible state before any broadcast.

use crossbeam_skiplist::{SkipMap, SkipSet};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::crdt::{Clock, LwwDictionary, Timestamp};
use crate::error::{ProtocolError, Result, StoreError, SyncError};
use crate::protocol::{Intent, ServerMessage};
use crate::store::{Snapshot, SnapshotStore};

/// Identifies one connected replica for the lifetime of its connection.
pub type ReplicaId = u64;

/// Lifecycle of a replica connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    /// Accepted by the transport, snapshot not yet queued
    Connecting,
    /// Snapshot queued, receiving broadcasts
    Synced,
    /// Removed from the broadcast set
    Closed,
}

/// Tuning knobs for the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Outbound messages queued per replica before it counts as unresponsive
    pub replica_buffer: usize,
    /// Consecutive checkpoint failures before the engine reports degraded
    pub persist_failure_threshold: u32,
    /// Longest a single checkpoint may hold the writer lock
    pub persist_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            replica_buffer: 256,
            persist_failure_threshold: 3,
            persist_timeout: Duration::from_secs(5),
        }
    }
}

/// Checkpointing health, as reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PersistenceHealth {
    pub consecutive_failures: u32,
    pub degraded: bool,
}

/// Receiving end of a connected replica.
///
/// The first message is always `initial_data`; everything after it is
/// broadcasts and replies in the order the engine produced them.
pub struct Replica {
    id: ReplicaId,
    outbox: mpsc::Receiver<ServerMessage>,
}

impl Replica {
    pub fn id(&self) -> ReplicaId {
        self.id
    }

    /// Waits for the next outbound message. `None` once the replica is closed.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbox.recv().await
    }

    /// Returns a queued message without waiting.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.outbox.try_recv().ok()
    }

    pub fn into_parts(self) -> (ReplicaId, mpsc::Receiver<ServerMessage>) {
        (self.id, self.outbox)
    }
}

struct ReplicaHandle {
    outbox: mpsc::Sender<ServerMessage>,
}

/// The authoritative coordinator shared by every connection.
pub struct SyncEngine {
    dictionary: LwwDictionary<String, Value>,
    clock: Clock,
    store: Arc<dyn SnapshotStore>,
    replicas: SkipMap<ReplicaId, ReplicaHandle>,
    /// Ids handed out whose snapshot has not been queued yet
    pending: SkipSet<ReplicaId>,
    next_replica: AtomicU64,
    /// Serializes mutations, checkpoints and broadcasts
    writer: Mutex<()>,
    persist_failures: AtomicU32,
    config: EngineConfig,
}

impl SyncEngine {
    /// Creates an engine with an empty dictionary.
    pub fn new(store: Arc<dyn SnapshotStore>, config: EngineConfig) -> Self {
        Self::with_dictionary(LwwDictionary::new(), store, config)
    }

    /// Creates an engine around an existing dictionary.
    ///
    /// The clock is advanced past every stored timestamp so that new writes
    /// always outrank restored ones.
    pub fn with_dictionary(
        dictionary: LwwDictionary<String, Value>,
        store: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> Self {
        let clock = Clock::new();
        if let Some(latest) = dictionary.max_timestamp() {
            clock.observe(latest);
        }
        let config = EngineConfig {
            replica_buffer: config.replica_buffer.max(1),
            persist_timeout: config.persist_timeout.max(Duration::from_millis(1)),
            ..config
        };

        SyncEngine {
            dictionary,
            clock,
            store,
            replicas: SkipMap::new(),
            pending: SkipSet::new(),
            next_replica: AtomicU64::new(1),
            writer: Mutex::new(()),
            persist_failures: AtomicU32::new(0),
            config,
        }
    }

    /// Creates an engine from the store's last snapshot.
    pub async fn restore(
        store: Arc<dyn SnapshotStore>,
        config: EngineConfig,
    ) -> std::result::Result<Self, StoreError> {
        let snapshot = store.load().await?;
        info!(
            "Restored {} elements ({} visible) from {}",
            snapshot.elements.len(),
            snapshot.projection().len(),
            store.describe()
        );
        Ok(Self::with_dictionary(snapshot.into_dictionary(), store, config))
    }

    /// Registers a new replica and queues its `initial_data` snapshot.
    pub async fn connect(&self) -> Replica {
        let id = self.open_replica();
        let _writer = self.writer.lock().await;
        self.pending.remove(&id);
        self.register(id)
    }

    /// Allocates an id for a replica that has not received its snapshot yet.
    ///
    /// The replica stays `Connecting` until [`SyncEngine::sync_replica`].
    pub fn open_replica(&self) -> ReplicaId {
        let id = self.next_replica.fetch_add(1, Ordering::SeqCst);
        self.pending.insert(id);
        debug!("Replica {} connecting", id);
        id
    }

    /// Queues `initial_data` for a connecting replica and adds it to the
    /// broadcast set.
    pub async fn sync_replica(&self, id: ReplicaId) -> Result<Replica> {
        let _writer = self.writer.lock().await;
        if self.pending.remove(&id).is_none() {
            return Err(SyncError::UnknownReplica(id));
        }
        Ok(self.register(id))
    }

    /// Caller holds the writer lock, which makes the snapshot and the
    /// registration atomic with respect to broadcasts.
    fn register(&self, id: ReplicaId) -> Replica {
        let (outbox, inbox) = mpsc::channel(self.config.replica_buffer);
        let data = self.dictionary.projection();
        let keys = data.len();
        // A fresh channel always has room for the first message.
        let _ = outbox.try_send(ServerMessage::initial_data(data));
        self.replicas.insert(id, ReplicaHandle { outbox });

        info!("Replica {} synced with {} keys", id, keys);
        Replica { id, outbox: inbox }
    }

    /// Removes a replica from the broadcast set.
    pub fn disconnect(&self, replica: ReplicaId) {
        let was_pending = self.pending.remove(&replica).is_some();
        if self.replicas.remove(&replica).is_some() || was_pending {
            info!("Replica {} disconnected", replica);
        }
    }

    pub fn state_of(&self, replica: ReplicaId) -> ReplicaState {
        if self.replicas.contains_key(&replica) {
            ReplicaState::Synced
        } else if self.pending.contains(&replica) {
            ReplicaState::Connecting
        } else {
            ReplicaState::Closed
        }
    }

    /// Handles one raw text message from `replica`.
    ///
    /// Rejected messages are answered with an error event to the sender only
    /// and never applied or broadcast.
    pub async fn handle(&self, replica: ReplicaId, text: &str) -> Result<()> {
        if !self.replicas.contains_key(&replica) {
            return Err(SyncError::UnknownReplica(replica));
        }

        let intent = match Intent::parse(text) {
            Ok(intent) => intent,
            Err(e) => {
                self.reject(replica, &e);
                return Err(e.into());
            }
        };

        self.apply(replica, intent).await
    }

    /// Answers a message that cannot be applied with an error event to its
    /// sender only.
    pub fn reject(&self, replica: ReplicaId, error: &ProtocolError) {
        warn!("Rejected message from replica {}: {}", replica, error);
        self.send_to(replica, ServerMessage::error(error.to_string()));
    }

    /// Applies an already parsed intent on behalf of `replica`.
    pub async fn apply(&self, replica: ReplicaId, intent: Intent) -> Result<()> {
        if !self.replicas.contains_key(&replica) {
            return Err(SyncError::UnknownReplica(replica));
        }

        match intent {
            Intent::Add { key, value } => {
                self.add(key, value).await;
            }
            Intent::Remove { key } => {
                self.remove(key).await;
            }
            Intent::Lookup { key } => {
                let value = self.dictionary.lookup(&key);
                debug!("Replica {} looked up {:?}", replica, key);
                self.send_to(replica, ServerMessage::lookup(key, value));
            }
        }
        Ok(())
    }

    /// Stamps, applies, checkpoints and broadcasts an add.
    pub async fn add(&self, key: String, value: Value) -> Timestamp {
        let _writer = self.writer.lock().await;
        let timestamp = self.clock.now();
        self.dictionary.add(key.clone(), value.clone(), timestamp);
        self.checkpoint().await;

        let delivered = self.broadcast(ServerMessage::added(key.clone(), value, timestamp));
        debug!("add {:?} @ {} delivered to {} replicas", key, timestamp, delivered);
        timestamp
    }

    /// Stamps, applies, checkpoints and broadcasts a remove.
    pub async fn remove(&self, key: String) -> Timestamp {
        let _writer = self.writer.lock().await;
        let timestamp = self.clock.now();
        self.dictionary.remove(&key, timestamp);
        self.checkpoint().await;

        let delivered = self.broadcast(ServerMessage::removed(key.clone(), timestamp));
        debug!("remove {:?} @ {} delivered to {} replicas", key, timestamp, delivered);
        timestamp
    }

    pub fn lookup(&self, key: &str) -> Option<Value> {
        self.dictionary.lookup(&key.to_string())
    }

    pub fn projection(&self) -> BTreeMap<String, Value> {
        self.dictionary.projection()
    }

    pub fn dictionary(&self) -> &LwwDictionary<String, Value> {
        &self.dictionary
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    pub fn persistence(&self) -> PersistenceHealth {
        let consecutive_failures = self.persist_failures.load(Ordering::SeqCst);
        PersistenceHealth {
            consecutive_failures,
            degraded: consecutive_failures >= self.config.persist_failure_threshold,
        }
    }

    /// Saves the current state. Failures and timeouts are logged and counted,
    /// never fatal.
    async fn checkpoint(&self) {
        let snapshot = Snapshot::of(&self.dictionary);
        let limit = self.config.persist_timeout;
        let saved = match timeout(limit, self.store.save(&snapshot)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::TimedOut {
                store: self.store.describe(),
                after: limit,
            }),
        };
        match saved {
            Ok(()) => {
                let previous = self.persist_failures.swap(0, Ordering::SeqCst);
                if previous > 0 {
                    info!("Checkpointing recovered after {} failures", previous);
                }
            }
            Err(e) => {
                let failures = self.persist_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.persist_failure_threshold {
                    error!(
                        "Checkpointing to {} failed {} times in a row, state is not durable: {}",
                        self.store.describe(),
                        failures,
                        e
                    );
                } else {
                    warn!("Checkpoint to {} failed: {}", self.store.describe(), e);
                }
            }
        }
    }

    /// Queues `message` for every replica; unresponsive ones are evicted.
    fn broadcast(&self, message: ServerMessage) -> usize {
        let mut delivered = 0;
        let mut evicted = Vec::new();

        for entry in self.replicas.iter() {
            if Self::deliver(*entry.key(), entry.value(), message.clone()) {
                delivered += 1;
            } else {
                evicted.push(*entry.key());
            }
        }

        for id in evicted {
            self.replicas.remove(&id);
        }
        delivered
    }

    fn send_to(&self, replica: ReplicaId, message: ServerMessage) {
        let Some(entry) = self.replicas.get(&replica) else {
            return;
        };
        if !Self::deliver(replica, entry.value(), message) {
            entry.remove();
        }
    }

    fn deliver(id: ReplicaId, handle: &ReplicaHandle, message: ServerMessage) -> bool {
        match handle.outbox.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Replica {} is not keeping up, dropping it", id);
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Replica {} channel closed", id);
                false
            }
        }
    }
}
