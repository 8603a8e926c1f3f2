// src/core/cluster/mod.rs

//! Cluster replication: the outgoing relay, incoming message dispatch, and
//! the application of replicated events to the local object runtime.

pub mod authority;
pub mod link;
pub mod listener;
pub mod protocol;

use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::core::VigilError;
use crate::core::checker::scheduler::SchedulerCommand;
use crate::core::cluster::authority::FEATURE_NOTIFIER;
use crate::core::events::{Event, SubscriptionId};
use crate::core::now_ts;
use crate::core::objects::checkable::{Host, Service};
use crate::core::objects::entity::Entity;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::processor;
use crate::core::replay::JournalRequest;
use crate::core::runtime_ops;
use crate::core::state::EngineState;
use self::protocol::{
    AckClearedParams, AckSetParams, CheckResultParams, CommentParams, ConfigUpdateParams,
    DowntimeParams, Envelope, HeartbeatParams, Message, NextCheckParams, ReplayParams,
    message_for_event, methods,
};

/// Subscribes the cluster relay to the event bus: locally originated events
/// are translated into wire messages and handed to the relay queue. The
/// handler holds a `Weak` so the bus never keeps the engine alive.
pub fn attach_relay_subscriber(engine: &Arc<EngineState>) -> SubscriptionId {
    let weak: Weak<EngineState> = Arc::downgrade(engine);
    engine.bus.subscribe(None, move |event: &Event| {
        let Some(engine) = weak.upgrade() else {
            return;
        };
        // Remote-originated events were already journaled and forwarded on
        // receipt; re-originating them here would loop.
        if event.authority() != engine.local_name {
            return;
        }
        let sequence = engine.sequences.next();
        if let Some(message) = message_for_event(event, &engine.local_name, sequence) {
            engine.enqueue_relay(message);
        }
    })
}

/// Appends a message to the journal and reports whether it reached disk.
async fn journal_append(engine: &EngineState, message: Message) -> bool {
    let (ack_tx, ack_rx) = oneshot::channel();
    if engine
        .journal_tx
        .send(JournalRequest::Append {
            message,
            ack: Some(ack_tx),
        })
        .await
        .is_err()
    {
        return false;
    }
    ack_rx.await.unwrap_or(false)
}

/// Fans a journaled message out to every live link except `skip`.
fn forward_to_links(engine: &EngineState, message: &Message, skip: Option<&str>) {
    let mut stalled = Vec::new();
    for entry in engine.links.iter() {
        if Some(entry.name.as_str()) == skip || !entry.is_live() {
            continue;
        }
        if entry.try_send(message.clone()).is_err() {
            warn!(
                "Peer '{}' cannot keep up with replication; dropping its link.",
                entry.name
            );
            stalled.push(entry.value().clone());
        }
    }
    for handle in stalled {
        handle.close();
    }
}

/// The outgoing relay task: journals every locally originated message, then
/// forwards it. A journal failure halts forwarding (the journal is the
/// authoritative record) but leaves local scheduling untouched.
pub async fn run_relay(
    engine: Arc<EngineState>,
    mut relay_rx: mpsc::Receiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    emit_config_snapshot(&engine).await;
    info!("Cluster relay started.");
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => return,
            maybe_message = relay_rx.recv() => {
                let Some(message) = maybe_message else { return };
                if !journal_append(&engine, message.clone()).await {
                    warn!("Journal unavailable; replication paused for this message.");
                    continue;
                }
                forward_to_links(&engine, &message, None);
            }
        }
    }
}

/// Journals an idempotent `config::Update` snapshot of every checkable so
/// peers (re)learn the object set through replay.
async fn emit_config_snapshot(engine: &Arc<EngineState>) {
    let mut emitted = 0usize;
    for (key, cell) in engine.runtime.enumerate_checkables() {
        let properties = match cell.entity.lock().config_value() {
            Ok(properties) => properties,
            Err(e) => {
                warn!("Could not serialize config of '{key}': {e}");
                continue;
            }
        };
        let params = ConfigUpdateParams {
            kind: key.kind,
            name: key.name.clone(),
            properties,
            authority: engine.local_name.clone(),
            envelope: Envelope {
                source: engine.local_name.clone(),
                sequence: engine.sequences.next(),
            },
        };
        let Ok(params) = serde_json::to_value(params) else {
            continue;
        };
        let message = Message::new(methods::CONFIG_UPDATE, params);
        if journal_append(engine, message.clone()).await {
            forward_to_links(engine, &message, None);
            emitted += 1;
        }
    }
    debug!("Journaled {emitted} config snapshots.");
}

/// Refreshes the `seen` timestamp on a peer's endpoint entity.
pub fn touch_endpoint(engine: &EngineState, peer: &str) {
    let key = ObjectKey::new(ObjectKind::Endpoint, peer.to_string());
    if let Some(cell) = engine.runtime.lookup(&key)
        && let Some(endpoint) = cell.entity.lock().as_endpoint_mut()
    {
        endpoint.state.seen = now_ts();
    }
}

/// Handles one message received from a peer. A returned error means the link
/// must be dropped (protocol violation); everything recoverable is logged
/// and swallowed.
pub async fn dispatch_incoming(
    engine: &Arc<EngineState>,
    peer: &str,
    message: Message,
) -> Result<(), VigilError> {
    touch_endpoint(engine, peer);
    match message.method.as_str() {
        methods::HELLO => {
            // A repeated hello only refreshes the acknowledged position.
            if let Ok(hello) = serde_json::from_value::<protocol::HelloParams>(message.params) {
                engine.bookmarks.advance_remote(peer, hello.log_position);
            }
            Ok(())
        }
        methods::HEARTBEAT => {
            let heartbeat: HeartbeatParams = serde_json::from_value(message.params)
                .map_err(|e| VigilError::ProtocolViolation(format!("malformed heartbeat: {e}")))?;
            engine.bookmarks.advance_remote(peer, heartbeat.log_position);
            Ok(())
        }
        methods::LOG_REPLAY => {
            let replay: ReplayParams = serde_json::from_value(message.params)
                .map_err(|e| VigilError::ProtocolViolation(format!("malformed replay: {e}")))?;
            Box::pin(dispatch_incoming(engine, peer, *replay.message)).await
        }
        methods::LOG_REPLAY_COMPLETE => {
            debug!("Peer '{peer}' finished its replay stream.");
            Ok(())
        }
        methods::LOG_SHUTDOWN => {
            info!("Peer '{peer}' announced a clean shutdown.");
            if let Some(link) = engine.links.get(peer) {
                link.close();
            }
            Ok(())
        }
        _ if message.is_journaled() => handle_journaled(engine, peer, message).await,
        other => Err(VigilError::ProtocolViolation(format!(
            "unknown method '{other}'"
        ))),
    }
}

/// Dedup, authority routing check, journaling, application and forwarding of
/// one replicated event-class message.
async fn handle_journaled(
    engine: &Arc<EngineState>,
    peer: &str,
    message: Message,
) -> Result<(), VigilError> {
    let (source, sequence) = message.envelope().ok_or_else(|| {
        VigilError::ProtocolViolation(format!("'{}' without source/sequence", message.method))
    })?;
    if source == engine.local_name {
        // Our own message came back around the mesh.
        return Ok(());
    }
    if !engine.sequences.accept(&source, sequence) {
        debug!(
            "Dropping duplicate {} from '{source}' (sequence {sequence}).",
            message.method
        );
        return Ok(());
    }

    let object = message_object(&message).ok_or_else(|| {
        VigilError::ProtocolViolation(format!("'{}' without object", message.method))
    })?;
    let authority = message.claimed_authority().unwrap_or(&source).to_string();
    if !engine.origin_permitted(&authority, &object) {
        warn!(
            "Dropping {} for '{object}': authority '{authority}' may not originate events for it.",
            message.method
        );
        return Ok(());
    }

    if !journal_append(engine, message.clone()).await {
        warn!("Journal unavailable; relayed message applied but not persisted.");
    }
    if let Err(e) = apply_message(engine, &message) {
        warn!("Could not apply {} for '{object}': {e}", message.method);
    }
    forward_to_links(engine, &message, Some(peer));
    Ok(())
}

/// The `(type, name)` a journaled message refers to.
fn message_object(message: &Message) -> Option<ObjectKey> {
    if message.method == methods::CONFIG_UPDATE {
        let kind: ObjectKind =
            serde_json::from_value(message.params.get("type")?.clone()).ok()?;
        let name = message.params.get("name")?.as_str()?;
        return Some(ObjectKey::new(kind, name.to_string()));
    }
    serde_json::from_value(message.params.get("object")?.clone()).ok()
}

/// Applies one replicated message to the local object runtime.
fn apply_message(engine: &Arc<EngineState>, message: &Message) -> Result<(), VigilError> {
    let runtime = &engine.runtime;
    let bus = &engine.bus;
    match message.method.as_str() {
        methods::CHECK_RESULT => {
            let params: CheckResultParams = parse_params(message)?;
            let may_notify = engine.is_authoritative(&params.object, FEATURE_NOTIFIER);
            processor::process_check_result(
                runtime,
                bus,
                &params.object,
                params.cr,
                &params.authority,
                may_notify,
            )
        }
        methods::STATE_CHANGE => {
            // Informational: the canonical state is rederived from the
            // replicated CheckResults.
            Ok(())
        }
        methods::NEXT_CHECK_CHANGED => {
            let params: NextCheckParams = parse_params(message)?;
            if let Some(cell) = runtime.lookup(&params.object) {
                let mut entity = cell.entity.lock();
                if let Some((_, state, _)) = entity.checkable_mut() {
                    state.next_check = params.next_check;
                }
            }
            engine.notify_scheduler(SchedulerCommand::NextCheckChanged(params.object));
            Ok(())
        }
        methods::COMMENT_ADDED => {
            let params: CommentParams = parse_params(message)?;
            runtime_ops::apply_comment(runtime, bus, params.comment, &params.authority)
        }
        methods::COMMENT_REMOVED => {
            let params: CommentParams = parse_params(message)?;
            runtime_ops::remove_comment(runtime, bus, params.comment.id, &params.authority)
        }
        methods::DOWNTIME_ADDED => {
            let params: DowntimeParams = parse_params(message)?;
            runtime_ops::apply_downtime(runtime, bus, params.downtime, &params.authority)
        }
        methods::DOWNTIME_REMOVED => {
            let params: DowntimeParams = parse_params(message)?;
            runtime_ops::remove_downtime(runtime, bus, params.downtime.id, &params.authority)
        }
        methods::DOWNTIME_TRIGGERED => {
            let params: DowntimeParams = parse_params(message)?;
            runtime_ops::trigger_downtime(runtime, bus, params.downtime.id, &params.authority)
        }
        methods::ACK_SET => {
            let params: AckSetParams = parse_params(message)?;
            runtime_ops::set_acknowledgement(
                runtime,
                bus,
                &params.object,
                &params.author,
                &params.text,
                params.ack_type,
                params.expiry,
                &params.authority,
            )
        }
        methods::ACK_CLEARED => {
            let params: AckClearedParams = parse_params(message)?;
            runtime_ops::clear_acknowledgement(runtime, bus, &params.object, &params.authority)
        }
        methods::CONFIG_UPDATE => {
            let params: ConfigUpdateParams = parse_params(message)?;
            apply_config_update(engine, params)
        }
        other => Err(VigilError::ProtocolViolation(format!(
            "unhandled journaled method '{other}'"
        ))),
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(message: &Message) -> Result<T, VigilError> {
    serde_json::from_value(message.params.clone()).map_err(|e| {
        VigilError::ProtocolViolation(format!("malformed {} params: {e}", message.method))
    })
}

/// Applies an idempotent config snapshot: registers the object if it is new,
/// replaces its config block otherwise. Only hosts and services replicate
/// this way; cluster topology stays local configuration.
pub fn apply_config_update(
    engine: &Arc<EngineState>,
    params: ConfigUpdateParams,
) -> Result<(), VigilError> {
    let key = ObjectKey::new(params.kind, params.name.clone());
    match params.kind {
        ObjectKind::Host => {
            let parents: Vec<String> = params
                .properties
                .get("parents")
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default();
            let config = serde_json::from_value(params.properties.clone())?;
            match engine.runtime.lookup(&key) {
                Some(cell) => {
                    let mut entity = cell.entity.lock();
                    if let Entity::Host(host) = &mut *entity {
                        host.config = config;
                        host.parents = parents;
                    }
                }
                None => {
                    engine
                        .runtime
                        .register(key.clone(), Entity::Host(Host::new(config, parents)))?;
                    engine.notify_scheduler(SchedulerCommand::ObjectAdded(key.clone()));
                }
            }
        }
        ObjectKind::Service => {
            let host_name: String = params
                .properties
                .get("host_name")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let config = serde_json::from_value(params.properties.clone())?;
            match engine.runtime.lookup(&key) {
                Some(cell) => {
                    let mut entity = cell.entity.lock();
                    if let Entity::Service(service) = &mut *entity {
                        service.config = config;
                        service.host_name = host_name;
                    }
                }
                None => {
                    engine.runtime.register(
                        key.clone(),
                        Entity::Service(Service::new(host_name, config)),
                    )?;
                    engine.notify_scheduler(SchedulerCommand::ObjectAdded(key.clone()));
                }
            }
        }
        other => {
            warn!("Ignoring config update for non-replicated type '{other}'.");
            return Ok(());
        }
    }
    engine.bus.publish(&Event::ConfigUpdated {
        object: key,
        properties: params.properties,
        authority: params.authority,
    });
    Ok(())
}
