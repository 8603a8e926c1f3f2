// src/core/notification.rs

//! Periodic reminder notifications for unhandled hard problem states.
//!
//! The initial problem notification is emitted by the state machine when a
//! problem hardens; this task re-sends it every `notification_interval`
//! seconds for as long as the problem stays hard, unsuppressed and
//! unacknowledged.

use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Duration;
use tracing::info;

use crate::core::checkresult::StateType;
use crate::core::cluster::authority::FEATURE_NOTIFIER;
use crate::core::events::{Event, NotificationKind};
use crate::core::now_ts;
use crate::core::processor;
use crate::core::state::EngineState;

const REMINDER_TICK: Duration = Duration::from_secs(5);

pub async fn run_reminder_task(engine: Arc<EngineState>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(REMINDER_TICK);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    info!("Notification reminder task started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            _ = ticker.tick() => send_due_reminders(&engine),
        }
    }
}

/// One reminder sweep over all checkables this peer is notifier for.
pub fn send_due_reminders(engine: &EngineState) {
    let now = now_ts();
    for (key, cell) in engine.runtime.enumerate_checkables() {
        if !engine.is_authoritative(&key, FEATURE_NOTIFIER) {
            continue;
        }
        let reachable = processor::is_reachable(&engine.runtime, &key);
        let mut entity = cell.entity.lock();
        let Some((config, state, _)) = entity.checkable_mut() else {
            continue;
        };
        if config.notification_interval <= 0.0 {
            continue;
        }
        if state.state_type != StateType::Hard || state.state.is_ok() {
            continue;
        }
        // Only remind once the initial notification for this problem went
        // out.
        if state.last_problem_notification < state.last_hard_state_change {
            continue;
        }
        if now < state.last_problem_notification + config.notification_interval {
            continue;
        }
        if !state.enable_notifications
            || state.in_downtime_depth > 0
            || state.is_acknowledged(now)
            || state.flapping
            || !reachable
            || !config.notification_period.contains(now)
        {
            continue;
        }
        state.last_problem_notification = now;
        let current = state.state;
        engine.bus.publish(&Event::NotificationSent {
            object: key.clone(),
            kind: NotificationKind::Reminder,
            state: current,
            authority: engine.local_name.clone(),
        });
    }
}
