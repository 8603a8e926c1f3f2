// src/main.rs

//! The main entry point for the Vigil monitoring engine.

use anyhow::Result;
use std::env;
use vigil::config::{Config, ENV_CONFIG_FILE};
use vigil::core::VigilError;
use vigil::server;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Vigil version {VERSION}");
        return Ok(());
    }

    // Determine the configuration path: the --config flag wins, then the
    // compatibility environment variable, then the conventional default.
    let env_config = env::var(ENV_CONFIG_FILE).ok();
    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str())
        .or(env_config.as_deref())
        .unwrap_or("vigil.toml");

    // Load the configuration. An unstartable configuration exits with 1.
    let config = match Config::from_file(config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Failed to load configuration from \"{config_path}\": {e:#}");
            std::process::exit(1);
        }
    };

    // Setup logging: RUST_LOG wins over the configured level.
    let log_level = env::var("RUST_LOG").unwrap_or_else(|_| config.engine.log_level.clone());
    tracing_subscriber::registry()
        .with(EnvFilter::new(log_level))
        .with(
            tracing_subscriber::fmt::layer()
                .compact() // Use the compact, single-line format.
                .with_ansi(true),
        )
        .init();

    if let Err(e) = server::run(config).await {
        error!("Engine runtime error: {e:#}");
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<VigilError>())
            .map(VigilError::exit_code)
            .unwrap_or(3);
        std::process::exit(code);
    }

    Ok(())
}
