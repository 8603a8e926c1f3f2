// src/core/objects/runtime.rs

//! The canonical `(type, name) → entity` arena.
//!
//! The runtime exclusively owns every entity. Each entity carries its own
//! mutex; operations that need several locks take them in canonical
//! `(type, name)` order through `with_locked` to preclude deadlock.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::core::VigilError;
use crate::core::events::{Event, EventBus};
use crate::core::now_ts;
use crate::core::objects::entity::Entity;
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::schema::{AttrClass, find_attr};

/// One arena slot: creation timestamp plus the per-entity lock.
#[derive(Debug)]
pub struct ObjectCell {
    pub created: f64,
    pub entity: Mutex<Entity>,
}

/// One line of the `state.dat` snapshot.
#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotLine {
    #[serde(rename = "type")]
    kind: ObjectKind,
    name: String,
    state: Value,
}

pub struct ObjectRuntime {
    objects: DashMap<ObjectKey, Arc<ObjectCell>>,
    bus: Arc<EventBus>,
}

impl ObjectRuntime {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            objects: DashMap::new(),
            bus,
        }
    }

    /// Registers a new entity. Fails with `AlreadyExists` on collision.
    pub fn register(&self, key: ObjectKey, entity: Entity) -> Result<Arc<ObjectCell>, VigilError> {
        match self.objects.entry(key.clone()) {
            Entry::Occupied(_) => Err(VigilError::AlreadyExists(key.to_string())),
            Entry::Vacant(slot) => {
                let cell = Arc::new(ObjectCell {
                    created: now_ts(),
                    entity: Mutex::new(entity),
                });
                slot.insert(cell.clone());
                Ok(cell)
            }
        }
    }

    /// Removes an entity, returning its cell if it existed.
    pub fn remove(&self, key: &ObjectKey) -> Option<Arc<ObjectCell>> {
        self.objects.remove(key).map(|(_, cell)| cell)
    }

    pub fn lookup(&self, key: &ObjectKey) -> Option<Arc<ObjectCell>> {
        self.objects.get(key).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.contains_key(key)
    }

    /// All entities of one type, sorted by name.
    pub fn enumerate(&self, kind: ObjectKind) -> Vec<(ObjectKey, Arc<ObjectCell>)> {
        let mut entries: Vec<_> = self
            .objects
            .iter()
            .filter(|entry| entry.key().kind == kind)
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// All checkables (hosts then services), sorted by `(type, name)`.
    pub fn enumerate_checkables(&self) -> Vec<(ObjectKey, Arc<ObjectCell>)> {
        let mut entries = self.enumerate(ObjectKind::Host);
        entries.extend(self.enumerate(ObjectKind::Service));
        entries
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Validated attribute modification. State-class changes emit
    /// `AttributeChanged` on the bus while the entity lock is held.
    pub fn modify(
        &self,
        key: &ObjectKey,
        attr: &str,
        value: Value,
        authority: &str,
    ) -> Result<(), VigilError> {
        let cell = self
            .lookup(key)
            .ok_or_else(|| VigilError::UnknownObject(key.to_string()))?;
        let mut entity = cell.entity.lock();
        let spec = find_attr(Entity::schema(key.kind), attr).ok_or_else(|| {
            VigilError::UnknownAttribute {
                kind: key.kind.to_string(),
                attr: attr.to_string(),
            }
        })?;
        let class = spec.class;
        let old = entity.set_attr(attr, value.clone())?;
        if class == AttrClass::State && old != value {
            self.bus.publish(&Event::AttributeChanged {
                object: key.clone(),
                attr: attr.to_string(),
                old,
                new: value,
                authority: authority.to_string(),
            });
        }
        Ok(())
    }

    /// Locks a set of entities in canonical order and runs `f` over the
    /// guards (sorted the same way). Missing keys fail with `UnknownObject`
    /// before any lock is taken.
    pub fn with_locked<R>(
        &self,
        keys: &[ObjectKey],
        f: impl FnOnce(&mut [MutexGuard<'_, Entity>]) -> R,
    ) -> Result<R, VigilError> {
        let mut sorted: Vec<ObjectKey> = keys.to_vec();
        sorted.sort();
        sorted.dedup();
        let cells: Vec<Arc<ObjectCell>> = sorted
            .iter()
            .map(|key| {
                self.lookup(key)
                    .ok_or_else(|| VigilError::UnknownObject(key.to_string()))
            })
            .collect::<Result<_, _>>()?;
        let mut guards: Vec<MutexGuard<'_, Entity>> =
            cells.iter().map(|cell| cell.entity.lock()).collect();
        Ok(f(&mut guards))
    }

    /// Serializes every entity's state-class attributes to a
    /// newline-delimited JSON journal, sorted by `(type, name)`, written
    /// atomically via a temp file.
    pub fn snapshot(&self, path: &Path) -> Result<usize, VigilError> {
        let mut entries: Vec<_> = self
            .objects
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let tmp_path = path.with_extension("tmp");
        let mut written = 0usize;
        {
            let mut file = fs::File::create(&tmp_path)
                .map_err(|e| VigilError::StatePersist(format!("create '{}': {e}", tmp_path.display())))?;
            for (key, cell) in entries {
                let state = cell.entity.lock().state_value()?;
                let line = SnapshotLine {
                    kind: key.kind,
                    name: key.name,
                    state,
                };
                serde_json::to_writer(&mut file, &line)?;
                file.write_all(b"\n")
                    .map_err(|e| VigilError::StatePersist(e.to_string()))?;
                written += 1;
            }
            file.sync_all()
                .map_err(|e| VigilError::StatePersist(e.to_string()))?;
        }
        fs::rename(&tmp_path, path)
            .map_err(|e| VigilError::StatePersist(format!("rename '{}': {e}", path.display())))?;
        debug!("Snapshotted {} entities to {}.", written, path.display());
        Ok(written)
    }

    /// Restores state-class attributes from a snapshot. Entities unknown to
    /// the current config are dropped with a warning. Idempotent.
    pub fn restore(&self, path: &Path) -> Result<usize, VigilError> {
        let file = match fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No snapshot at {}; starting fresh.", path.display());
                return Ok(0);
            }
            Err(e) => return Err(e.into()),
        };
        let mut restored = 0usize;
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let parsed: SnapshotLine = match serde_json::from_str(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        "Skipping corrupt snapshot line {} in {}: {e}",
                        lineno + 1,
                        path.display()
                    );
                    continue;
                }
            };
            let key = ObjectKey::new(parsed.kind, parsed.name);
            match self.lookup(&key) {
                Some(cell) => {
                    if let Err(e) = cell.entity.lock().apply_state(parsed.state) {
                        warn!("Could not restore state of '{key}': {e}");
                    } else {
                        restored += 1;
                    }
                }
                None => {
                    // Comments and downtimes are runtime-created; rebuild
                    // them as long as their checkable still exists. Anything
                    // else unknown to the current config is dropped.
                    let rebuilt = Entity::from_persisted_state(key.kind, &parsed.state);
                    match rebuilt {
                        Some(entity)
                            if entity
                                .parent_checkable()
                                .is_some_and(|parent| self.contains(&parent)) =>
                        {
                            self.register(key, entity)?;
                            restored += 1;
                        }
                        _ => {
                            warn!("Dropping snapshot state for unknown object '{key}'.");
                        }
                    }
                }
            }
        }
        Ok(restored)
    }
}
