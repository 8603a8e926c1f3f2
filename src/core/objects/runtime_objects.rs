// src/core/objects/runtime_objects.rs

//! Comments and downtimes: runtime-created entities parented to a checkable.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

use crate::core::objects::key::ObjectKey;
use crate::core::objects::schema::{self, AttrClass, AttrSpec};

/// Allocator for the stable legacy integer ids carried alongside UUIDs.
/// Seeded after restore so ids never regress across restarts.
#[derive(Debug, Default)]
pub struct LegacyIdCounter(AtomicU64);

impl LegacyIdCounter {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Raises the floor so future ids start above `seen`.
    pub fn observe(&self, seen: u64) {
        self.0.fetch_max(seen, Ordering::Relaxed);
    }
}

/// A free-form comment attached to a checkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: Uuid,
    pub legacy_id: u64,
    /// `(type, name)` of the owning checkable.
    pub checkable: ObjectKey,
    pub author: String,
    pub text: String,
    pub entry_time: f64,
    /// Unix timestamp; `0` means never expires.
    #[serde(default)]
    pub expiry: f64,
}

impl Comment {
    pub fn is_expired(&self, now: f64) -> bool {
        self.expiry > 0.0 && self.expiry <= now
    }
}

/// A scheduled maintenance window attached to a checkable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Downtime {
    pub id: Uuid,
    pub legacy_id: u64,
    pub checkable: ObjectKey,
    pub author: String,
    pub text: String,
    pub entry_time: f64,
    pub start_time: f64,
    pub end_time: f64,
    /// Whether the window has opened and the checkable's downtime depth was
    /// incremented.
    #[serde(default)]
    pub triggered: bool,
}

impl Downtime {
    pub fn is_expired(&self, now: f64) -> bool {
        self.end_time <= now
    }

    /// Whether the window should open now.
    pub fn should_trigger(&self, now: f64) -> bool {
        !self.triggered && self.start_time <= now && now < self.end_time
    }
}

pub fn comment_schema() -> &'static [AttrSpec] {
    const SCHEMA: &[AttrSpec] = &[
        AttrSpec::new("id", AttrClass::State, schema::d_string),
        AttrSpec::new("legacy_id", AttrClass::State, schema::d_zero),
        AttrSpec::new("checkable", AttrClass::State, schema::d_null),
        AttrSpec::new("author", AttrClass::State, schema::d_string),
        AttrSpec::new("text", AttrClass::State, schema::d_string),
        AttrSpec::new("entry_time", AttrClass::State, schema::d_zero),
        AttrSpec::new("expiry", AttrClass::State, schema::d_zero),
    ];
    SCHEMA
}

pub fn downtime_schema() -> &'static [AttrSpec] {
    const SCHEMA: &[AttrSpec] = &[
        AttrSpec::new("id", AttrClass::State, schema::d_string),
        AttrSpec::new("legacy_id", AttrClass::State, schema::d_zero),
        AttrSpec::new("checkable", AttrClass::State, schema::d_null),
        AttrSpec::new("author", AttrClass::State, schema::d_string),
        AttrSpec::new("text", AttrClass::State, schema::d_string),
        AttrSpec::new("entry_time", AttrClass::State, schema::d_zero),
        AttrSpec::new("start_time", AttrClass::State, schema::d_zero),
        AttrSpec::new("end_time", AttrClass::State, schema::d_zero),
        AttrSpec::new("triggered", AttrClass::State, schema::d_false),
    ];
    SCHEMA
}
