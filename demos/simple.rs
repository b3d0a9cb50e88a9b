//! Simple standalone example of the sync engine.
//!
//! Two replicas edit the shared dictionary, a third joins late and catches
//! up from the initial snapshot.
//!
//! Run with: cargo run --example simple

use lww_sync::{EngineConfig, MemorySnapshotStore, SyncEngine};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    println!("=== Simple LWW sync example ===\n");

    let engine = SyncEngine::new(Arc::new(MemorySnapshotStore::new()), EngineConfig::default());

    let mut alice = engine.connect().await;
    let mut bob = engine.connect().await;
    println!("Alice joins: {:?}", alice.try_recv());
    println!("Bob joins:   {:?}\n", bob.try_recv());

    // Alice and Bob both write the same key; the later timestamp wins
    engine
        .handle(alice.id(), r#"{"action":"add","key":"title","value":"Draft"}"#)
        .await
        .ok();
    engine
        .handle(bob.id(), r#"{"action":"add","key":"title","value":"Final"}"#)
        .await
        .ok();
    engine
        .handle(alice.id(), r#"{"action":"add","key":"owner","value":"alice"}"#)
        .await
        .ok();
    engine
        .handle(bob.id(), r#"{"action":"remove","key":"owner"}"#)
        .await
        .ok();

    println!("--- Broadcasts seen by Alice ---");
    while let Some(message) = alice.try_recv() {
        println!("  {}", message.to_json().unwrap_or_default());
    }

    println!("\n--- Broadcasts seen by Bob ---");
    while let Some(message) = bob.try_recv() {
        println!("  {}", message.to_json().unwrap_or_default());
    }

    let mut carol = engine.connect().await;
    println!("\n--- Carol joins late ---");
    if let Some(snapshot) = carol.try_recv() {
        println!("  {}", snapshot.to_json().unwrap_or_default());
    }

    println!("\nFinal state: {:?}", engine.projection());
}
