// src/core/objects/schema.rs

//! Declares the per-type attribute schema that drives validation, snapshotting
//! and config replication.
//!
//! Every entity type enumerates its attributes as `(name, class, default)`
//! triples. The runtime reflects over these declarations instead of hand-rolled
//! dictionary conversions: `Snapshot`/`Restore` serialize exactly the
//! state-class attributes, `Modify` validates attribute names and rejects
//! writes to config-class attributes after load.

use serde_json::{Value, json};

/// The lifecycle class of an attribute.
///
/// `Config` attributes are immutable after load and re-read from the config
/// source on restart. `State` attributes are persisted across restarts and
/// replicated to peers. `Runtime` attributes are volatile and local-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttrClass {
    Config,
    State,
    Runtime,
}

/// A single attribute declaration.
pub struct AttrSpec {
    pub name: &'static str,
    pub class: AttrClass,
    pub default: fn() -> Value,
}

impl AttrSpec {
    pub const fn new(name: &'static str, class: AttrClass, default: fn() -> Value) -> Self {
        Self {
            name,
            class,
            default,
        }
    }
}

pub fn d_null() -> Value {
    Value::Null
}
pub fn d_zero() -> Value {
    json!(0.0)
}
pub fn d_one() -> Value {
    json!(1)
}
pub fn d_true() -> Value {
    json!(true)
}
pub fn d_false() -> Value {
    json!(false)
}
pub fn d_string() -> Value {
    json!("")
}
pub fn d_list() -> Value {
    json!([])
}

/// Looks an attribute up in a schema slice.
pub fn find_attr<'a>(schema: &'a [AttrSpec], name: &str) -> Option<&'a AttrSpec> {
    schema.iter().find(|spec| spec.name == name)
}

/// Returns the names of all attributes of the given class.
pub fn attrs_of_class(schema: &[AttrSpec], class: AttrClass) -> impl Iterator<Item = &'static str> {
    schema
        .iter()
        .filter(move |spec| spec.class == class)
        .map(|spec| spec.name)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &[AttrSpec] = &[
        AttrSpec::new("check_interval", AttrClass::Config, d_zero),
        AttrSpec::new("state", AttrClass::State, d_one),
        AttrSpec::new("executing", AttrClass::Runtime, d_false),
    ];

    #[test]
    fn find_attr_resolves_declared_names() {
        assert!(find_attr(SCHEMA, "state").is_some());
        assert!(find_attr(SCHEMA, "nope").is_none());
    }

    #[test]
    fn class_filter_partitions_schema() {
        let state: Vec<_> = attrs_of_class(SCHEMA, AttrClass::State).collect();
        assert_eq!(state, vec!["state"]);
        assert_eq!((SCHEMA[0].default)(), json!(0.0));
    }
}
