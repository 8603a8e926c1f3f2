// src/core/objects/key.rs

//! The `(type, name)` identity every entity is addressed by.

use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::{Display, EnumString};

/// The runtime type tag of an entity.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ObjectKind {
    Host,
    Service,
    Comment,
    Downtime,
    Endpoint,
    Zone,
}

/// The canonical identity of an entity. Ordering is `(kind, name)`, which is
/// also the canonical multi-lock order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }

    pub fn host(name: impl Into<String>) -> Self {
        Self::new(ObjectKind::Host, name)
    }

    /// Services are named `host!service`.
    pub fn service(host: &str, service: &str) -> Self {
        Self::new(ObjectKind::Service, format!("{host}!{service}"))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.name)
    }
}
