// src/core/state.rs

//! Defines the central `EngineState` struct, holding all shared engine-wide
//! state, and the channel bundle consumed by the task spawner.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::config::Config;
use crate::core::VigilError;
use crate::core::checker::executor::{CheckCommand, CheckRunner};
use crate::core::checker::scheduler::SchedulerCommand;
use crate::core::checkresult::CheckResult;
use crate::core::cluster::authority::{self, FEATURE_NOTIFIER};
use crate::core::cluster::link::PeerHandle;
use crate::core::cluster::protocol::Message;
use crate::core::events::EventBus;
use crate::core::now_ts;
use crate::core::objects::checkable::{Host, Service};
use crate::core::objects::endpoint::{Endpoint, Zone};
use crate::core::objects::entity::Entity;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::runtime::ObjectRuntime;
use crate::core::objects::runtime_objects::LegacyIdCounter;
use crate::core::processor;
use crate::core::replay::{BookmarkStore, JournalPosition, JournalRequest, SequenceTracker};

/// Channel capacity for the relay queue feeding the cluster.
const RELAY_QUEUE_CAPACITY: usize = 16384;
/// Channel capacity for the journal writer. Large so slow disks do not
/// back up event processing.
const JOURNAL_QUEUE_CAPACITY: usize = 65536;
const SCHEDULER_QUEUE_CAPACITY: usize = 4096;

/// Contains all initialized components required to spawn the engine's
/// background tasks. Created once during initialization and consumed by the
/// spawner.
pub struct EngineInit {
    pub state: Arc<EngineState>,
    pub scheduler_rx: mpsc::Receiver<SchedulerCommand>,
    pub journal_rx: mpsc::Receiver<JournalRequest>,
    pub relay_rx: mpsc::Receiver<Message>,
}

/// The central struct holding all shared engine-wide state. Wrapped in an
/// `Arc` and passed to nearly every task, providing a single source of truth.
pub struct EngineState {
    pub config: Config,
    /// The local peer identity; equals the local certificate CN.
    pub local_name: String,
    pub local_zone: String,
    /// The canonical entity arena.
    pub runtime: ObjectRuntime,
    pub bus: Arc<EventBus>,
    /// Check definitions by name.
    pub commands: HashMap<String, CheckCommand>,
    pub runner: Arc<dyn CheckRunner>,
    /// Live peer links by certificate CN.
    pub links: DashMap<String, PeerHandle>,
    pub bookmarks: BookmarkStore,
    pub sequences: SequenceTracker,
    pub legacy_ids: LegacyIdCounter,
    /// Highest journaled timestamp, advertised in hellos and heartbeats.
    pub journal_position: Arc<JournalPosition>,
    /// Cleared when a journal append fails; replication pauses until the
    /// writer recovers.
    pub journal_healthy: Arc<AtomicBool>,
    pub scheduler_tx: mpsc::Sender<SchedulerCommand>,
    pub journal_tx: mpsc::Sender<JournalRequest>,
    pub relay_tx: mpsc::Sender<Message>,
    pub shutdown_tx: broadcast::Sender<()>,
    pub started_at: f64,
}

impl EngineState {
    /// Builds the engine state and registers the configured entity set.
    pub fn initialize(
        config: Config,
        runner: Arc<dyn CheckRunner>,
    ) -> Result<EngineInit, VigilError> {
        let bus = Arc::new(EventBus::new());
        let runtime = ObjectRuntime::new(bus.clone());

        let (scheduler_tx, scheduler_rx) = mpsc::channel(SCHEDULER_QUEUE_CAPACITY);
        let (journal_tx, journal_rx) = mpsc::channel(JOURNAL_QUEUE_CAPACITY);
        let (relay_tx, relay_rx) = mpsc::channel(RELAY_QUEUE_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(8);

        let commands = config
            .check_commands
            .iter()
            .map(|cmd| (cmd.name.clone(), cmd.clone()))
            .collect();

        let state = Arc::new(EngineState {
            local_name: config.engine.node_name.clone(),
            local_zone: config.engine.zone.clone(),
            config,
            runtime,
            bus,
            commands,
            runner,
            links: DashMap::new(),
            bookmarks: BookmarkStore::new(),
            sequences: SequenceTracker::new(),
            legacy_ids: LegacyIdCounter::default(),
            journal_position: Arc::new(JournalPosition::default()),
            journal_healthy: Arc::new(AtomicBool::new(true)),
            scheduler_tx,
            journal_tx,
            relay_tx,
            shutdown_tx,
            started_at: now_ts(),
        });
        state.register_config_objects()?;
        Ok(EngineInit {
            state,
            scheduler_rx,
            journal_rx,
            relay_rx,
        })
    }

    /// Seeds the object runtime from the validated config tables.
    fn register_config_objects(&self) -> Result<(), VigilError> {
        for def in &self.config.zones {
            self.runtime.register(
                ObjectKey::new(ObjectKind::Zone, def.name.clone()),
                Entity::Zone(Zone {
                    endpoints: def.endpoints.clone(),
                    parent: def.parent.clone(),
                }),
            )?;
        }
        for def in &self.config.endpoints {
            self.runtime.register(
                ObjectKey::new(ObjectKind::Endpoint, def.name.clone()),
                Entity::Endpoint(Endpoint {
                    host: def.host.clone(),
                    port: def.port,
                    features: def.features.clone(),
                    state: Default::default(),
                }),
            )?;
        }
        for def in &self.config.hosts {
            let config = def.checkable.resolve(&self.local_zone, &self.config.flapping);
            self.runtime.register(
                ObjectKey::host(def.name.clone()),
                Entity::Host(Host::new(config, def.parents.clone())),
            )?;
        }
        for def in &self.config.services {
            let config = def.checkable.resolve(&self.local_zone, &self.config.flapping);
            self.runtime.register(
                ObjectKey::service(&def.host, &def.name),
                Entity::Service(Service::new(def.host.clone(), config)),
            )?;
        }
        Ok(())
    }

    /// The zone that owns an object; comments and downtimes follow their
    /// checkable, everything else defaults to the local zone.
    pub fn zone_of(&self, key: &ObjectKey) -> String {
        match key.kind {
            ObjectKind::Host | ObjectKind::Service => self
                .runtime
                .lookup(key)
                .and_then(|cell| {
                    cell.entity
                        .lock()
                        .checkable()
                        .map(|(config, _)| config.zone.clone())
                })
                .filter(|zone| !zone.is_empty())
                .unwrap_or_else(|| self.local_zone.clone()),
            ObjectKind::Comment | ObjectKind::Downtime => self
                .runtime
                .lookup(key)
                .and_then(|cell| {
                    let entity = cell.entity.lock();
                    entity
                        .as_comment()
                        .map(|c| c.checkable.clone())
                        .or_else(|| entity.as_downtime().map(|d| d.checkable.clone()))
                })
                .map(|parent| self.zone_of(&parent))
                .unwrap_or_else(|| self.local_zone.clone()),
            _ => self.local_zone.clone(),
        }
    }

    /// The zone a configured endpoint belongs to.
    pub fn zone_of_endpoint(&self, endpoint: &str) -> Option<String> {
        self.runtime
            .enumerate(ObjectKind::Zone)
            .into_iter()
            .find(|(_, cell)| {
                cell.entity
                    .lock()
                    .as_zone()
                    .is_some_and(|zone| zone.endpoints.iter().any(|name| name == endpoint))
            })
            .map(|(key, _)| key.name)
    }

    /// Whether `ancestor` is `zone` itself or a transitive parent of it.
    pub fn zone_is_ancestor(&self, ancestor: &str, zone: &str) -> bool {
        let mut current = zone.to_string();
        loop {
            if current == ancestor {
                return true;
            }
            let parent = self
                .runtime
                .lookup(&ObjectKey::new(ObjectKind::Zone, current))
                .and_then(|cell| cell.entity.lock().as_zone().and_then(|z| z.parent.clone()));
            match parent {
                Some(parent) => current = parent,
                None => return false,
            }
        }
    }

    /// Whether a message originated by `origin` may mutate `object`: the
    /// origin's zone must own the object or be an ancestor of the owning
    /// zone.
    pub fn origin_permitted(&self, origin: &str, object: &ObjectKey) -> bool {
        let Some(origin_zone) = self.zone_of_endpoint(origin) else {
            return false;
        };
        let object_zone = self.zone_of(object);
        self.zone_is_ancestor(&origin_zone, &object_zone)
    }

    /// The connected endpoints of a zone that accept `feature`, sorted by
    /// name. The local endpoint always counts as connected.
    pub fn connected_members(&self, zone: &str, feature: &str) -> Vec<String> {
        let Some(cell) = self.runtime.lookup(&ObjectKey::new(ObjectKind::Zone, zone.to_string()))
        else {
            return Vec::new();
        };
        let members = match cell.entity.lock().as_zone() {
            Some(zone) => zone.endpoints.clone(),
            None => return Vec::new(),
        };
        let mut connected: Vec<String> = members
            .into_iter()
            .filter(|name| *name == self.local_name || self.links.contains_key(name))
            .filter(|name| self.endpoint_accepts(name, feature))
            .collect();
        connected.sort();
        connected
    }

    fn endpoint_accepts(&self, endpoint: &str, feature: &str) -> bool {
        self.runtime
            .lookup(&ObjectKey::new(ObjectKind::Endpoint, endpoint.to_string()))
            .and_then(|cell| {
                cell.entity
                    .lock()
                    .as_endpoint()
                    .map(|ep| ep.features.is_empty() || ep.features.iter().any(|f| f == feature))
            })
            .unwrap_or(false)
    }

    /// Whether this peer currently holds `feature` authority over an object.
    pub fn is_authoritative(&self, key: &ObjectKey, feature: &str) -> bool {
        let zone = self.zone_of(key);
        let members = self.connected_members(&zone, feature);
        authority::authority_for(&members, &key.name, feature) == Some(self.local_name.as_str())
    }

    /// Applies a locally produced CheckResult through the state machine.
    pub fn apply_local_check_result(
        &self,
        key: &ObjectKey,
        cr: CheckResult,
    ) -> Result<(), VigilError> {
        let may_notify = self.is_authoritative(key, FEATURE_NOTIFIER);
        processor::process_check_result(
            &self.runtime,
            &self.bus,
            key,
            cr,
            &self.local_name,
            may_notify,
        )
    }

    /// Accepts a CheckResult from an external source (command pipe or
    /// cluster). No job is enqueued; the result goes straight through the
    /// state machine, gated by `enable_passive_checks`.
    pub fn submit_passive_result(
        &self,
        key: &ObjectKey,
        cr: CheckResult,
    ) -> Result<(), VigilError> {
        let accepts = self
            .runtime
            .lookup(key)
            .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?
            .entity
            .lock()
            .checkable()
            .map(|(_, state)| state.enable_passive_checks)
            .unwrap_or(false);
        if !accepts {
            return Ok(());
        }
        self.apply_local_check_result(key, cr)
    }

    /// Hands a command to the scheduler without blocking; scheduling keeps
    /// working off slightly stale data when the queue is saturated.
    pub fn notify_scheduler(&self, command: SchedulerCommand) {
        if let Err(e) = self.scheduler_tx.try_send(command) {
            warn!("Scheduler queue saturated, dropping notification: {e}");
        }
    }

    /// Queues an outgoing message for the cluster relay.
    pub fn enqueue_relay(&self, message: Message) {
        if let Err(e) = self.relay_tx.try_send(message) {
            warn!("Relay queue saturated, dropping outgoing message: {e}");
        }
    }

    pub fn begin_shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
