// src/server/run_loop.rs

//! The engine main loop: waits for shutdown signals, supervises background
//! tasks, and drives the graceful shutdown sequence.

use super::context::ServerContext;
use crate::core::cluster::protocol::{Message, methods};
use anyhow::{Result, anyhow};
use serde_json::json;
use tokio::time::{Duration, Instant};
use tracing::{error, info, warn};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// How long graceful shutdown waits for background tasks before giving up.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Waits for a shutdown signal: SIGINT or SIGTERM on Unix.
#[cfg(unix)]
async fn await_shutdown_signal() {
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGINT handler: {e}");
            return std::future::pending().await;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {e}");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = sigint.recv() => info!("SIGINT received, initiating graceful shutdown."),
        _ = sigterm.recv() => info!("SIGTERM received, initiating graceful shutdown."),
    }
}

/// Waits for Ctrl+C on Windows.
#[cfg(windows)]
async fn await_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Ctrl-C received, initiating graceful shutdown.");
}

/// Runs until a shutdown signal arrives or a critical task dies, then shuts
/// the engine down cleanly.
pub async fn run(mut ctx: ServerContext) -> Result<()> {
    let mut failure: Option<anyhow::Error> = None;
    loop {
        tokio::select! {
            biased;

            _ = await_shutdown_signal() => break,

            // Supervise background tasks for unexpected termination.
            Some(res) = ctx.background_tasks.join_next() => {
                match res {
                    Ok(Ok(())) => info!("A background task completed."),
                    Ok(Err(e)) => {
                        error!("CRITICAL: background task failed: {e}. Shutting down.");
                        failure = Some(e);
                        break;
                    }
                    Err(e) => {
                        error!("CRITICAL: background task panicked: {e:?}. Shutting down.");
                        failure = Some(anyhow!("background task panicked: {e}"));
                        break;
                    }
                }
            },
        }
    }

    graceful_shutdown(ctx).await;
    match failure {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// The shutdown sequence: stop scheduling, announce to peers, drain tasks,
/// snapshot state, close links.
async fn graceful_shutdown(mut ctx: ServerContext) {
    info!("Graceful shutdown started.");

    // Announce the clean shutdown to every live peer before the links die.
    for link in ctx.state.links.iter() {
        let _ = link.try_send(Message::new(methods::LOG_SHUTDOWN, json!({})));
    }

    let _ = ctx.shutdown_tx.send(());

    let deadline = Instant::now() + SHUTDOWN_GRACE;
    loop {
        match tokio::time::timeout_at(deadline, ctx.background_tasks.join_next()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => {
                warn!("Background tasks did not finish within the grace period.");
                ctx.background_tasks.abort_all();
                break;
            }
        }
    }

    for link in ctx.state.links.iter() {
        link.close();
    }

    // Final state snapshot; a failure here is logged but does not change the
    // exit path.
    if let Err(e) = ctx.state.runtime.snapshot(&ctx.state.config.state_file()) {
        error!("Final snapshot failed: {e}");
    }
    if let Err(e) = ctx.state.bookmarks.save(&ctx.state.config.bookmarks_file()) {
        error!("Final bookmark save failed: {e}");
    }
    info!("Shutdown complete.");
}
