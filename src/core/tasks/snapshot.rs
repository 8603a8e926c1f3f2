// src/core/tasks/snapshot.rs

//! Periodic persistence of entity state and replication bookmarks.
//!
//! Persistence failures are logged and retried on the next tick; they never
//! stop the engine.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{error, info};

use crate::core::state::EngineState;

const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(60);

pub async fn run_snapshot_task(engine: Arc<EngineState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(SNAPSHOT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so startup restore settles.
    ticker.tick().await;
    info!("Snapshot task started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => persist_once(&engine).await,
        }
    }
}

/// One snapshot pass. Blocking file I/O runs off the async threads.
pub async fn persist_once(engine: &Arc<EngineState>) {
    let engine = engine.clone();
    let result = tokio::task::spawn_blocking(move || {
        engine
            .runtime
            .snapshot(&engine.config.state_file())
            .and_then(|written| {
                engine.bookmarks.save(&engine.config.bookmarks_file())?;
                Ok(written)
            })
    })
    .await;
    match result {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!("State snapshot failed (will retry): {e}"),
        Err(e) => error!("Snapshot task join error: {e}"),
    }
}
