// src/core/tasks/heartbeat.rs

//! Cluster heartbeats: advertises the local journal position to every live
//! peer, tears down links that went silent, and mirrors the replication
//! bookmarks into the endpoint entities for persistence.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::core::cluster::protocol::{HeartbeatParams, Message, methods};
use crate::core::now_ts;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::state::EngineState;

/// Heartbeat intervals a peer may miss before its link is declared dead.
const STALE_MULTIPLIER: f64 = 3.0;

pub async fn run_heartbeat_task(engine: Arc<EngineState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(engine.config.cluster.heartbeat_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Heartbeat task started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => beat_once(&engine),
        }
    }
}

/// One heartbeat round.
pub fn beat_once(engine: &EngineState) {
    let now = now_ts();
    let position = engine.journal_position.get();
    let stale_after = engine.config.cluster.heartbeat_interval.as_secs_f64() * STALE_MULTIPLIER;

    let mut stalled = Vec::new();
    for entry in engine.links.iter() {
        if !entry.is_live() {
            continue;
        }
        let message = Message::new(
            methods::HEARTBEAT,
            json!(HeartbeatParams {
                identity: engine.local_name.clone(),
                log_position: position,
            }),
        );
        if entry.try_send(message).is_err() {
            warn!("Heartbeat to '{}' failed; dropping its link.", entry.name);
            stalled.push(entry.value().clone());
            continue;
        }
        // A peer that stopped talking for several intervals is gone.
        let seen = engine
            .runtime
            .lookup(&ObjectKey::new(ObjectKind::Endpoint, entry.name.clone()))
            .and_then(|cell| cell.entity.lock().as_endpoint().map(|ep| ep.state.seen))
            .unwrap_or(0.0);
        if seen > 0.0 && now - seen > stale_after && now - entry.established > stale_after {
            warn!(
                "Peer '{}' silent for {:.0}s; dropping its link.",
                entry.name,
                now - seen
            );
            stalled.push(entry.value().clone());
        }
    }
    for handle in stalled {
        handle.close();
    }

    // Mirror the bookmark store into the endpoint entities so the positions
    // ride along with the state snapshot.
    for (peer, positions) in engine.bookmarks.snapshot() {
        if let Some(cell) = engine
            .runtime
            .lookup(&ObjectKey::new(ObjectKind::Endpoint, peer))
            && let Some(endpoint) = cell.entity.lock().as_endpoint_mut()
        {
            endpoint.state.local_log_position = positions.local;
            endpoint.state.remote_log_position = positions.remote;
        }
    }
}
