// src/core/processor.rs

//! The state machine: consumes CheckResults, produces the next
//! `(state, state_type, current_attempt)` and emits events.

use tracing::debug;

use crate::core::VigilError;
use crate::core::checkresult::{CheckResult, CheckState, StateSnapshot, StateType};
use crate::core::events::{Event, EventBus, NotificationKind};
use crate::core::flapping;
use crate::core::now_ts;
use crate::core::objects::checkable::AckType;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::runtime::ObjectRuntime;

/// Whether a host's parents are all known up. Non-recursive: only the
/// parents' last-known state counts. Missing parents are treated as up.
pub fn host_reachable(runtime: &ObjectRuntime, host_name: &str) -> bool {
    let Some(cell) = runtime.lookup(&ObjectKey::host(host_name)) else {
        return true;
    };
    let parents = match cell.entity.lock().as_host() {
        Some(host) => host.parents.clone(),
        None => return true,
    };
    parents.iter().all(|parent| {
        runtime
            .lookup(&ObjectKey::host(parent))
            .and_then(|cell| {
                cell.entity
                    .lock()
                    .as_host()
                    .map(|host| host.state.state == CheckState::Up)
            })
            .unwrap_or(true)
    })
}

/// Reachability of a checkable: hosts through their parents, services through
/// their owning host.
pub fn is_reachable(runtime: &ObjectRuntime, key: &ObjectKey) -> bool {
    match key.kind {
        ObjectKind::Host => host_reachable(runtime, &key.name),
        ObjectKind::Service => {
            let Some(cell) = runtime.lookup(key) else {
                return true;
            };
            let host_name = match cell.entity.lock().as_service() {
                Some(service) => service.host_name.clone(),
                None => return true,
            };
            host_reachable(runtime, &host_name)
        }
        _ => true,
    }
}

/// Applies one CheckResult to a checkable and emits the resulting events.
///
/// `may_notify` is the caller's notifier-authority verdict; non-authoritative
/// peers apply results but never produce notifications. The per-entity lock
/// is held across the mutation and the event publication, never across I/O.
pub fn process_check_result(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    key: &ObjectKey,
    mut cr: CheckResult,
    authority: &str,
    may_notify: bool,
) -> Result<(), VigilError> {
    let reachable = is_reachable(runtime, key);
    let cell = runtime
        .lookup(key)
        .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
    let now = now_ts();

    let mut entity = cell.entity.lock();
    let (config, state, _) = entity
        .checkable_mut()
        .ok_or_else(|| VigilError::InvariantViolation {
            object: key.to_string(),
            reason: "check result for a non-checkable entity".into(),
        })?;

    // Duplicate-work window between peers: accept only the newest result.
    if cr.execution_end < state.last_check_end {
        debug!("Discarding stale check result for '{key}'.");
        return Ok(());
    }

    cr.vars_before = Some(StateSnapshot {
        state: state.state,
        state_type: state.state_type,
        attempt: state.current_attempt,
        reachable,
    });

    let old_state = state.state;
    let old_type = state.state_type;
    let new_state = cr.state;
    let state_changed = new_state != old_state;
    let max_attempts = config.max_check_attempts.max(1);

    // Attempt counter. Hard problems pin the counter to the maximum; a hard
    // OK keeps it at 1.
    if state_changed {
        state.current_attempt = 1;
    } else if old_type == StateType::Hard {
        state.current_attempt = if new_state.is_ok() { 1 } else { max_attempts };
    } else if !new_state.is_ok() {
        state.current_attempt = (state.current_attempt + 1).min(max_attempts);
    }

    // Promotion to hard.
    let new_type = if !state_changed && old_type == StateType::Hard {
        StateType::Hard
    } else if !state_changed && new_state.is_ok() {
        // A repeated OK inside the soft window confirms the recovery.
        StateType::Hard
    } else if state.current_attempt >= max_attempts {
        StateType::Hard
    } else {
        StateType::Soft
    };

    state.state = new_state;
    state.state_type = new_type;
    if state_changed || new_type != old_type {
        state.last_state_change = now;
    }

    let hardened = new_type == StateType::Hard && (old_type == StateType::Soft || state_changed);
    if hardened {
        // Set together with last_state_change above, preserving
        // last_hard_state_change <= last_state_change.
        state.last_hard_state_change = now;
    }

    // Acknowledgement lifecycle: normal acks clear on any state change,
    // every ack clears on recovery or expiry.
    let mut ack_cleared = false;
    if state.acknowledgement != AckType::None {
        let expired = state.acknowledgement_expiry > 0.0 && state.acknowledgement_expiry <= now;
        if new_state.is_ok()
            || expired
            || (state_changed && state.acknowledgement == AckType::Normal)
        {
            state.acknowledgement = AckType::None;
            state.acknowledgement_expiry = 0.0;
            ack_cleared = true;
        }
    }

    // Flap detection.
    flapping::push_transition(&mut state.flap_history, state_changed);
    state.flapping_current = flapping::change_ratio(&state.flap_history);
    let mut flap_event = None;
    if state.enable_flapping {
        let next_flapping = flapping::update_flapping(
            state.flapping,
            state.flapping_current,
            config.high_flap_threshold,
            config.low_flap_threshold,
        );
        if next_flapping != state.flapping {
            state.flapping = next_flapping;
            flap_event = Some(next_flapping);
        }
    }

    // Reschedule.
    let interval = if new_type == StateType::Soft && new_state.is_problem() {
        config.retry_interval
    } else {
        config.check_interval
    };
    state.next_check = now + interval;
    state.last_check_end = cr.execution_end;

    cr.vars_after = Some(StateSnapshot {
        state: state.state,
        state_type: state.state_type,
        attempt: state.current_attempt,
        reachable,
    });
    state.last_check_result = Some(cr.clone());

    // Notification decision for the fresh problem, before the lock drops.
    let wants_notification = may_notify
        && state.enable_notifications
        && new_type == StateType::Hard
        && new_state.is_problem()
        && state.in_downtime_depth == 0
        && !state.is_acknowledged(now)
        && !state.flapping
        && reachable
        && config.notification_period.contains(now)
        && state.last_problem_notification < state.last_hard_state_change;
    if wants_notification {
        state.last_problem_notification = now;
    }
    let notified_state = state.state;
    let notified_type = state.state_type;

    // Event publication, still under the entity lock.
    bus.publish(&Event::CheckResult {
        object: key.clone(),
        cr,
        authority: authority.to_string(),
    });
    if hardened || (new_type == StateType::Soft && state_changed) {
        bus.publish(&Event::StateChange {
            object: key.clone(),
            state: notified_state,
            state_type: notified_type,
            authority: authority.to_string(),
        });
    }
    if let Some(started) = flap_event {
        bus.publish(&Event::FlappingChanged {
            object: key.clone(),
            started,
            authority: authority.to_string(),
        });
    }
    if ack_cleared {
        bus.publish(&Event::AcknowledgementCleared {
            object: key.clone(),
            authority: authority.to_string(),
        });
    }
    bus.publish(&Event::NextCheckChanged {
        object: key.clone(),
        next_check: now + interval,
        authority: authority.to_string(),
    });
    if wants_notification {
        bus.publish(&Event::NotificationSent {
            object: key.clone(),
            kind: NotificationKind::Problem,
            state: notified_state,
            authority: authority.to_string(),
        });
    }
    Ok(())
}
