// src/server/spawner.rs

//! Spawns all of the engine's long-running background tasks.

use super::context::ServerContext;
use crate::core::checker::CheckScheduler;
use crate::core::cluster;
use crate::core::cluster::listener::{run_connector, run_listener};
use crate::core::notification::run_reminder_task;
use crate::core::replay::JournalWriterTask;
use crate::core::state::EngineInit;
use crate::core::tasks::{
    expiry::run_expiry_task, heartbeat::run_heartbeat_task, snapshot::run_snapshot_task,
};
use anyhow::Result;
use tracing::info;

/// Spawns all critical background tasks into the provided JoinSet.
pub async fn spawn_all(ctx: &mut ServerContext) -> Result<()> {
    let state = &ctx.state;
    let shutdown_tx = &ctx.shutdown_tx;
    let background_tasks = &mut ctx.background_tasks;

    let init = std::mem::replace(
        &mut ctx.init_channels,
        EngineInit {
            state: state.clone(),
            scheduler_rx: tokio::sync::mpsc::channel(1).1,
            journal_rx: tokio::sync::mpsc::channel(1).1,
            relay_rx: tokio::sync::mpsc::channel(1).1,
        },
    );

    // --- Journal writer (owns the live segment) ---
    let journal_writer = JournalWriterTask::new(
        state.config.log_dir(),
        state.config.journal.segment_max_bytes,
        state.config.journal.retention,
        init.journal_rx,
        state.journal_healthy.clone(),
        state.journal_position.clone(),
    );
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        journal_writer.run(shutdown_rx).await;
        Ok(())
    });

    // --- Cluster relay: bus events out to the journal and the peers ---
    cluster::attach_relay_subscriber(state);
    let relay_state = state.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        cluster::run_relay(relay_state, init.relay_rx, shutdown_rx).await;
        Ok(())
    });

    // --- Check scheduler ---
    let scheduler = CheckScheduler::new(state.clone(), init.scheduler_rx);
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        scheduler.run(shutdown_rx).await;
        Ok(())
    });

    // --- Peer transport ---
    if let Some(tls) = ctx.tls.clone() {
        let listener_state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        let acceptor = tls.acceptor.clone();
        background_tasks.spawn(async move {
            run_listener(listener_state, acceptor, shutdown_rx).await?;
            Ok(())
        });

        for endpoint in &state.config.endpoints {
            if endpoint.name == state.local_name {
                continue;
            }
            let (Some(host), Some(port)) = (endpoint.host.clone(), endpoint.port) else {
                info!(
                    "Endpoint '{}' has no connect address; accepting inbound only.",
                    endpoint.name
                );
                continue;
            };
            let connector_state = state.clone();
            let connector = tls.connector.clone();
            let name = endpoint.name.clone();
            let shutdown_rx = shutdown_tx.subscribe();
            background_tasks.spawn(async move {
                run_connector(connector_state, connector, name, host, port, shutdown_rx).await;
                Ok(())
            });
        }

        let heartbeat_state = state.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            run_heartbeat_task(heartbeat_state, shutdown_rx).await;
            Ok(())
        });
    }

    // --- Maintenance ---
    let snapshot_state = state.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        run_snapshot_task(snapshot_state, shutdown_rx).await;
        Ok(())
    });

    let expiry_state = state.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        run_expiry_task(expiry_state, shutdown_rx).await;
        Ok(())
    });

    let reminder_state = state.clone();
    let shutdown_rx = shutdown_tx.subscribe();
    background_tasks.spawn(async move {
        run_reminder_task(reminder_state, shutdown_rx).await;
        Ok(())
    });

    info!("All background tasks spawned.");
    Ok(())
}
