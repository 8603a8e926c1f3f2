// src/server/context.rs

use crate::core::cluster::listener::TlsMaterial;
use crate::core::state::{EngineInit, EngineState};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the engine's main loop.
pub struct ServerContext {
    pub state: Arc<EngineState>,
    pub init_channels: EngineInit,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
    /// Absent on a standalone node with no remote endpoints.
    pub tls: Option<TlsMaterial>,
}
