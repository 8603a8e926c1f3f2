// src/server/initialization.rs

//! Handles the complete engine initialization process: state setup, TLS
//! material, snapshot restore and replication bookkeeping recovery.

use super::context::ServerContext;
use crate::config::Config;
use crate::core::checker::PluginRunner;
use crate::core::cluster::listener::{TlsMaterial, setup_tls};
use crate::core::objects::key::ObjectKind;
use crate::core::replay::journal;
use crate::core::state::EngineState;
use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Initializes all engine components before the background tasks start.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);

    tokio::fs::create_dir_all(config.state_dir())
        .await
        .with_context(|| format!("creating state dir '{}'", config.state_dir().display()))?;
    tokio::fs::create_dir_all(config.log_dir())
        .await
        .with_context(|| format!("creating log dir '{}'", config.log_dir().display()))?;

    let tls = setup_tls_material(&config)?;

    let init = EngineState::initialize(config, Arc::new(PluginRunner))?;
    let state = init.state.clone();
    info!(
        "Engine state initialized with {} entities.",
        state.runtime.len()
    );

    restore_persisted_state(&state).await?;

    let shutdown_tx = state.shutdown_tx.clone();
    Ok(ServerContext {
        state,
        init_channels: init,
        shutdown_tx,
        background_tasks: JoinSet::new(),
        tls,
    })
}

fn setup_tls_material(config: &Config) -> Result<Option<TlsMaterial>> {
    let has_remote_peers = config
        .endpoints
        .iter()
        .any(|ep| ep.name != config.engine.node_name);
    if !has_remote_peers {
        info!("No remote endpoints configured; running standalone without peering.");
        return Ok(None);
    }
    let material = setup_tls(
        &config.tls.ca_path,
        &config.tls.cert_path,
        &config.tls.key_path,
    )?;
    info!("TLS material loaded; peer identity is '{}'.", config.engine.node_name);
    Ok(Some(material))
}

/// Restores the entity snapshot, the bookmarks, and the counters derived
/// from the journal.
async fn restore_persisted_state(state: &Arc<EngineState>) -> Result<()> {
    let restored = state.runtime.restore(&state.config.state_file())?;
    if restored > 0 {
        info!("Restored state for {restored} entities.");
    }
    state.bookmarks.load(&state.config.bookmarks_file())?;

    // Legacy ids must never regress across restarts.
    let mut highest_legacy = 0u64;
    for kind in [ObjectKind::Comment, ObjectKind::Downtime] {
        for (_, cell) in state.runtime.enumerate(kind) {
            let entity = cell.entity.lock();
            let legacy = entity
                .as_comment()
                .map(|c| c.legacy_id)
                .or_else(|| entity.as_downtime().map(|d| d.legacy_id))
                .unwrap_or(0);
            highest_legacy = highest_legacy.max(legacy);
        }
    }
    state.legacy_ids.observe(highest_legacy);

    // Recover the replication counters from the journal.
    let dir = state.config.log_dir();
    let local = state.local_name.clone();
    let scan_dir = dir.clone();
    let (position, own_sequence) = tokio::task::spawn_blocking(move || {
        let position = journal::last_position(&scan_dir)?;
        let own = journal::max_sequence_for(&scan_dir, &local)?;
        Ok::<_, crate::core::VigilError>((position, own))
    })
    .await??;
    state.journal_position.advance(position);
    state.sequences.seed(own_sequence);
    if position > 0.0 {
        info!(
            "Journal recovered: position {position:.3}, own sequence floor {own_sequence}."
        );
    }
    Ok(())
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Node '{}' in zone '{}'; {} hosts, {} services, {} endpoints.",
        config.engine.node_name,
        config.engine.zone,
        config.hosts.len(),
        config.services.len(),
        config.endpoints.len()
    );
    if config.hosts.is_empty() && config.services.is_empty() {
        warn!("No checkables configured; the scheduler will idle.");
    }
}
