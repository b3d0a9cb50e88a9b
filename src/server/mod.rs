//! Web server module for the sync service.
//!
//! This module contains the Axum web server implementation that exposes the
//! synchronization engine over WebSocket, plus the startup path that
//! restores the engine from its snapshot.

pub mod routes;
pub mod websocket;

use std::sync::Arc;
use tracing::{error, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::store::{FileSnapshotStore, MemorySnapshotStore};
use crate::sync::SyncEngine;

// Re-export main server functionality
pub use routes::*;

/// Builds the engine described by `config`.
///
/// A corrupt snapshot is moved aside and the engine starts empty. Any other
/// storage failure is returned, since the medium itself is unusable.
pub async fn open_engine(config: &Config) -> Result<SyncEngine, StoreError> {
    if config.in_memory {
        warn!("Running in memory only, state will not survive a restart");
        return Ok(SyncEngine::new(
            Arc::new(MemorySnapshotStore::new()),
            config.engine_config(),
        ));
    }

    let store = Arc::new(FileSnapshotStore::new(&config.snapshot_path));
    match SyncEngine::restore(store.clone(), config.engine_config()).await {
        Ok(engine) => Ok(engine),
        Err(StoreError::CorruptSnapshot { path, reason }) => {
            error!("Snapshot {} is corrupt: {}", path.display(), reason);
            let moved = store.quarantine().await?;
            warn!(
                "Moved corrupt snapshot to {}, starting with an empty dictionary",
                moved.display()
            );
            Ok(SyncEngine::new(store, config.engine_config()))
        }
        Err(e) => Err(e),
    }
}
