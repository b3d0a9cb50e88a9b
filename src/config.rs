//! Command-line and environment configuration for the server binary.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::sync::EngineConfig;

/// lww-sync: a shared last-write-wins dictionary served over WebSocket.
#[derive(Parser, Debug, Clone)]
#[command(name = "lww-sync", version, about, long_about = None)]
pub struct Config {
    /// Address to listen on.
    #[arg(long, env = "LWW_BIND", default_value = "127.0.0.1:3000")]
    pub bind: SocketAddr,

    /// File holding the durable snapshot.
    #[arg(long, env = "LWW_SNAPSHOT_PATH", default_value = "lww_snapshot.json")]
    pub snapshot_path: PathBuf,

    /// Keep state in memory only; nothing survives a restart.
    #[arg(long, env = "LWW_IN_MEMORY")]
    pub in_memory: bool,

    /// Outbound messages buffered per client before it is dropped as unresponsive.
    #[arg(long, env = "LWW_REPLICA_BUFFER", default_value_t = 256)]
    pub replica_buffer: usize,

    /// Consecutive failed checkpoints before the server reports itself degraded.
    #[arg(long, env = "LWW_PERSIST_FAILURE_THRESHOLD", default_value_t = 3)]
    pub persist_failure_threshold: u32,

    /// Milliseconds a checkpoint may take before it counts as failed.
    #[arg(long, env = "LWW_PERSIST_TIMEOUT_MS", default_value_t = 5000)]
    pub persist_timeout_ms: u64,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, env = "LWW_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            replica_buffer: self.replica_buffer,
            persist_failure_threshold: self.persist_failure_threshold,
            persist_timeout: Duration::from_millis(self.persist_timeout_ms),
        }
    }
}
