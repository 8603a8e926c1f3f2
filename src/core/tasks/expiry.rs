// src/core/tasks/expiry.rs

//! Expiry sweep: opens downtime windows that became due, removes elapsed
//! downtimes and comments, and clears expired acknowledgements.
//!
//! Every peer runs the sweep against its own runtime; the emitted events
//! replicate, and their application is idempotent, so concurrent sweeps on
//! other peers converge.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::{info, warn};

use crate::core::events::Event;
use crate::core::now_ts;
use crate::core::objects::checkable::AckType;
use crate::core::objects::key::ObjectKind;
use crate::core::runtime_ops;
use crate::core::state::EngineState;

const EXPIRY_TICK: Duration = Duration::from_secs(5);

pub async fn run_expiry_task(engine: Arc<EngineState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(EXPIRY_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Expiry task started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => sweep_once(&engine),
        }
    }
}

/// One expiry pass over acknowledgements, downtimes and comments.
pub fn sweep_once(engine: &EngineState) {
    let now = now_ts();

    // Acknowledgements with a passed expiry are cleared automatically.
    for (key, cell) in engine.runtime.enumerate_checkables() {
        let expired = {
            let mut entity = cell.entity.lock();
            match entity.checkable_mut() {
                Some((_, state, _)) => {
                    let expired = state.acknowledgement != AckType::None
                        && state.acknowledgement_expiry > 0.0
                        && state.acknowledgement_expiry <= now;
                    if expired {
                        state.acknowledgement = AckType::None;
                        state.acknowledgement_expiry = 0.0;
                    }
                    expired
                }
                None => false,
            }
        };
        if expired {
            engine.bus.publish(&Event::AcknowledgementCleared {
                object: key,
                authority: engine.local_name.clone(),
            });
        }
    }

    // Downtimes: trigger windows that opened, drop windows that closed.
    for (_, cell) in engine.runtime.enumerate(ObjectKind::Downtime) {
        let downtime = match cell.entity.lock().as_downtime() {
            Some(dt) => dt.clone(),
            None => continue,
        };
        if downtime.is_expired(now) {
            if let Err(e) = runtime_ops::remove_downtime(
                &engine.runtime,
                &engine.bus,
                downtime.id,
                &engine.local_name,
            ) {
                warn!("Could not expire downtime {}: {e}", downtime.id);
            }
        } else if downtime.should_trigger(now)
            && let Err(e) = runtime_ops::trigger_downtime(
                &engine.runtime,
                &engine.bus,
                downtime.id,
                &engine.local_name,
            )
        {
            warn!("Could not trigger downtime {}: {e}", downtime.id);
        }
    }

    // Comments with a passed expiry disappear.
    for (_, cell) in engine.runtime.enumerate(ObjectKind::Comment) {
        let comment = match cell.entity.lock().as_comment() {
            Some(comment) => comment.clone(),
            None => continue,
        };
        if comment.is_expired(now)
            && let Err(e) = runtime_ops::remove_comment(
                &engine.runtime,
                &engine.bus,
                comment.id,
                &engine.local_name,
            )
        {
            warn!("Could not expire comment {}: {e}", comment.id);
        }
    }
}
