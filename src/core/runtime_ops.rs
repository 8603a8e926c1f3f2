// src/core/runtime_ops.rs

//! Runtime mutations that arrive from commands and cluster messages:
//! acknowledgements, comments and downtimes.

use tracing::warn;
use uuid::Uuid;

use crate::core::VigilError;
use crate::core::events::{Event, EventBus};
use crate::core::now_ts;
use crate::core::objects::checkable::AckType;
use crate::core::objects::entity::Entity;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::runtime::ObjectRuntime;
use crate::core::objects::runtime_objects::{Comment, Downtime, LegacyIdCounter};

fn ensure_checkable(runtime: &ObjectRuntime, key: &ObjectKey) -> Result<(), VigilError> {
    match key.kind {
        ObjectKind::Host | ObjectKind::Service if runtime.contains(key) => Ok(()),
        ObjectKind::Host | ObjectKind::Service => Err(VigilError::UnknownObject(key.to_string())),
        _ => Err(VigilError::InvariantViolation {
            object: key.to_string(),
            reason: "comments, downtimes and acknowledgements attach to checkables".into(),
        }),
    }
}

/// Sets an acknowledgement on a checkable and emits `AcknowledgementSet`.
pub fn set_acknowledgement(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    key: &ObjectKey,
    author: &str,
    text: &str,
    ack_type: AckType,
    expiry: f64,
    authority: &str,
) -> Result<(), VigilError> {
    ensure_checkable(runtime, key)?;
    let cell = runtime
        .lookup(key)
        .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
    let mut entity = cell.entity.lock();
    let (_, state, _) = entity.checkable_mut().ok_or_else(|| VigilError::InvariantViolation {
        object: key.to_string(),
        reason: "acknowledgement on non-checkable".into(),
    })?;
    state.acknowledgement = ack_type;
    state.acknowledgement_expiry = expiry;
    bus.publish(&Event::AcknowledgementSet {
        object: key.clone(),
        author: author.to_string(),
        text: text.to_string(),
        ack_type,
        expiry,
        authority: authority.to_string(),
    });
    Ok(())
}

/// Clears any acknowledgement and emits `AcknowledgementCleared` if one was
/// set.
pub fn clear_acknowledgement(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    key: &ObjectKey,
    authority: &str,
) -> Result<(), VigilError> {
    let cell = runtime
        .lookup(key)
        .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
    let mut entity = cell.entity.lock();
    let Some((_, state, _)) = entity.checkable_mut() else {
        return Ok(());
    };
    if state.acknowledgement == AckType::None {
        return Ok(());
    }
    state.acknowledgement = AckType::None;
    state.acknowledgement_expiry = 0.0;
    bus.publish(&Event::AcknowledgementCleared {
        object: key.clone(),
        authority: authority.to_string(),
    });
    Ok(())
}

/// Creates a comment on a checkable, registers it and emits `CommentAdded`.
pub fn add_comment(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    ids: &LegacyIdCounter,
    checkable: &ObjectKey,
    author: &str,
    text: &str,
    expiry: f64,
    authority: &str,
) -> Result<Comment, VigilError> {
    let comment = Comment {
        id: Uuid::new_v4(),
        legacy_id: ids.next(),
        checkable: checkable.clone(),
        author: author.to_string(),
        text: text.to_string(),
        entry_time: now_ts(),
        expiry,
    };
    apply_comment(runtime, bus, comment.clone(), authority)?;
    Ok(comment)
}

/// Registers an existing comment (local or replicated). Idempotent: a
/// comment already known by id is left untouched.
pub fn apply_comment(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    comment: Comment,
    authority: &str,
) -> Result<(), VigilError> {
    ensure_checkable(runtime, &comment.checkable)?;
    let key = ObjectKey::new(ObjectKind::Comment, comment.id.to_string());
    match runtime.register(key.clone(), Entity::Comment(comment.clone())) {
        Ok(_) => {}
        Err(VigilError::AlreadyExists(_)) => return Ok(()),
        Err(e) => return Err(e),
    }
    bus.publish(&Event::CommentAdded {
        object: comment.checkable.clone(),
        comment,
        authority: authority.to_string(),
    });
    Ok(())
}

/// Removes a comment by id and emits `CommentRemoved`.
pub fn remove_comment(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    id: Uuid,
    authority: &str,
) -> Result<(), VigilError> {
    let key = ObjectKey::new(ObjectKind::Comment, id.to_string());
    let Some(cell) = runtime.remove(&key) else {
        return Ok(());
    };
    let comment = match cell.entity.lock().as_comment() {
        Some(comment) => comment.clone(),
        None => return Ok(()),
    };
    bus.publish(&Event::CommentRemoved {
        object: comment.checkable.clone(),
        comment,
        authority: authority.to_string(),
    });
    Ok(())
}

/// Creates a downtime window, registers it and emits `DowntimeAdded`.
pub fn add_downtime(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    ids: &LegacyIdCounter,
    checkable: &ObjectKey,
    author: &str,
    text: &str,
    start_time: f64,
    end_time: f64,
    authority: &str,
) -> Result<Downtime, VigilError> {
    if end_time <= start_time {
        return Err(VigilError::InvariantViolation {
            object: checkable.to_string(),
            reason: "downtime window is empty".into(),
        });
    }
    let downtime = Downtime {
        id: Uuid::new_v4(),
        legacy_id: ids.next(),
        checkable: checkable.clone(),
        author: author.to_string(),
        text: text.to_string(),
        entry_time: now_ts(),
        start_time,
        end_time,
        triggered: false,
    };
    apply_downtime(runtime, bus, downtime.clone(), authority)?;
    Ok(downtime)
}

/// Registers an existing downtime (local or replicated). Idempotent.
pub fn apply_downtime(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    downtime: Downtime,
    authority: &str,
) -> Result<(), VigilError> {
    ensure_checkable(runtime, &downtime.checkable)?;
    let key = ObjectKey::new(ObjectKind::Downtime, downtime.id.to_string());
    match runtime.register(key.clone(), Entity::Downtime(downtime.clone())) {
        Ok(_) => {}
        Err(VigilError::AlreadyExists(_)) => return Ok(()),
        Err(e) => return Err(e),
    }
    // Restore the depth contribution of an already-triggered replicated
    // window.
    if downtime.triggered {
        bump_downtime_depth(runtime, &downtime.checkable, 1);
    }
    bus.publish(&Event::DowntimeAdded {
        object: downtime.checkable.clone(),
        downtime,
        authority: authority.to_string(),
    });
    Ok(())
}

/// Opens a downtime window: marks it triggered, increments the checkable's
/// depth and emits `DowntimeTriggered`.
pub fn trigger_downtime(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    id: Uuid,
    authority: &str,
) -> Result<(), VigilError> {
    let key = ObjectKey::new(ObjectKind::Downtime, id.to_string());
    let Some(cell) = runtime.lookup(&key) else {
        return Ok(());
    };
    let downtime = {
        let mut entity = cell.entity.lock();
        let Some(dt) = entity.as_downtime_mut() else {
            return Ok(());
        };
        if dt.triggered {
            return Ok(());
        }
        dt.triggered = true;
        dt.clone()
    };
    bump_downtime_depth(runtime, &downtime.checkable, 1);
    bus.publish(&Event::DowntimeTriggered {
        object: downtime.checkable.clone(),
        downtime,
        authority: authority.to_string(),
    });
    Ok(())
}

/// Removes a downtime and undoes its depth contribution if it was triggered.
pub fn remove_downtime(
    runtime: &ObjectRuntime,
    bus: &EventBus,
    id: Uuid,
    authority: &str,
) -> Result<(), VigilError> {
    let key = ObjectKey::new(ObjectKind::Downtime, id.to_string());
    let Some(cell) = runtime.remove(&key) else {
        return Ok(());
    };
    let downtime = match cell.entity.lock().as_downtime() {
        Some(dt) => dt.clone(),
        None => return Ok(()),
    };
    if downtime.triggered {
        bump_downtime_depth(runtime, &downtime.checkable, -1);
    }
    bus.publish(&Event::DowntimeRemoved {
        object: downtime.checkable.clone(),
        downtime,
        authority: authority.to_string(),
    });
    Ok(())
}

fn bump_downtime_depth(runtime: &ObjectRuntime, checkable: &ObjectKey, delta: i64) {
    let Some(cell) = runtime.lookup(checkable) else {
        warn!("Downtime references unknown checkable '{checkable}'.");
        return;
    };
    let mut entity = cell.entity.lock();
    if let Some((_, state, _)) = entity.checkable_mut() {
        let depth = state.in_downtime_depth as i64 + delta;
        state.in_downtime_depth = depth.max(0) as u32;
    }
}
