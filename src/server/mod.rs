// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod context;
mod initialization;
mod run_loop;
mod spawner;

/// The main engine startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize engine state, TLS material, restore persisted state.
    let mut server_context = initialization::setup(config).await?;

    // 2. Spawn all background tasks.
    spawner::spawn_all(&mut server_context).await?;

    // 3. Run until shutdown; this drives the graceful exit sequence.
    run_loop::run(server_context).await
}
