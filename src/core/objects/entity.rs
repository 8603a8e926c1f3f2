// src/core/objects/entity.rs

//! The tagged entity variant carried by the object runtime arena.
//!
//! Cross-entity references are `(type, name)` keys resolved through the
//! runtime, never pointers, so the persisted state stays a pure data graph.

use serde_json::{Map, Value};

use crate::core::VigilError;
use crate::core::objects::checkable::{
    CheckableConfig, CheckableRuntime, CheckableState, Host, Service, host_schema, service_schema,
};
use crate::core::objects::endpoint::{Endpoint, Zone, endpoint_schema, zone_schema};
use crate::core::objects::key::{ObjectKey, ObjectKind};
use crate::core::objects::runtime_objects::{Comment, Downtime, comment_schema, downtime_schema};
use crate::core::objects::schema::{AttrClass, AttrSpec, find_attr};

#[derive(Debug, Clone)]
pub enum Entity {
    Host(Host),
    Service(Service),
    Comment(Comment),
    Downtime(Downtime),
    Endpoint(Endpoint),
    Zone(Zone),
}

impl Entity {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Entity::Host(_) => ObjectKind::Host,
            Entity::Service(_) => ObjectKind::Service,
            Entity::Comment(_) => ObjectKind::Comment,
            Entity::Downtime(_) => ObjectKind::Downtime,
            Entity::Endpoint(_) => ObjectKind::Endpoint,
            Entity::Zone(_) => ObjectKind::Zone,
        }
    }

    pub fn schema(kind: ObjectKind) -> &'static [AttrSpec] {
        match kind {
            ObjectKind::Host => host_schema(),
            ObjectKind::Service => service_schema(),
            ObjectKind::Comment => comment_schema(),
            ObjectKind::Downtime => downtime_schema(),
            ObjectKind::Endpoint => endpoint_schema(),
            ObjectKind::Zone => zone_schema(),
        }
    }

    pub fn as_host(&self) -> Option<&Host> {
        match self {
            Entity::Host(h) => Some(h),
            _ => None,
        }
    }

    pub fn as_service(&self) -> Option<&Service> {
        match self {
            Entity::Service(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Endpoint> {
        match self {
            Entity::Endpoint(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_endpoint_mut(&mut self) -> Option<&mut Endpoint> {
        match self {
            Entity::Endpoint(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_zone(&self) -> Option<&Zone> {
        match self {
            Entity::Zone(z) => Some(z),
            _ => None,
        }
    }

    pub fn as_comment(&self) -> Option<&Comment> {
        match self {
            Entity::Comment(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_downtime(&self) -> Option<&Downtime> {
        match self {
            Entity::Downtime(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_downtime_mut(&mut self) -> Option<&mut Downtime> {
        match self {
            Entity::Downtime(d) => Some(d),
            _ => None,
        }
    }

    /// Shared view over the checkable blocks of a host or service.
    pub fn checkable(&self) -> Option<(&CheckableConfig, &CheckableState)> {
        match self {
            Entity::Host(h) => Some((&h.config, &h.state)),
            Entity::Service(s) => Some((&s.config, &s.state)),
            _ => None,
        }
    }

    /// Mutable view over the checkable blocks of a host or service.
    pub fn checkable_mut(
        &mut self,
    ) -> Option<(&CheckableConfig, &mut CheckableState, &mut CheckableRuntime)> {
        match self {
            Entity::Host(h) => Some((&h.config, &mut h.state, &mut h.runtime)),
            Entity::Service(s) => Some((&s.config, &mut s.state, &mut s.runtime)),
            _ => None,
        }
    }

    fn class_value(&self, class: AttrClass) -> Result<Value, VigilError> {
        let value = match (self, class) {
            (Entity::Host(h), AttrClass::Config) => {
                let mut map = as_object(serde_json::to_value(&h.config)?);
                map.insert("parents".into(), serde_json::to_value(&h.parents)?);
                Value::Object(map)
            }
            (Entity::Host(h), AttrClass::State) => serde_json::to_value(&h.state)?,
            (Entity::Host(h), AttrClass::Runtime) => serde_json::to_value(&h.runtime)?,
            (Entity::Service(s), AttrClass::Config) => {
                let mut map = as_object(serde_json::to_value(&s.config)?);
                map.insert("host_name".into(), Value::String(s.host_name.clone()));
                Value::Object(map)
            }
            (Entity::Service(s), AttrClass::State) => serde_json::to_value(&s.state)?,
            (Entity::Service(s), AttrClass::Runtime) => serde_json::to_value(&s.runtime)?,
            (Entity::Comment(c), AttrClass::State) => serde_json::to_value(c)?,
            (Entity::Downtime(d), AttrClass::State) => serde_json::to_value(d)?,
            (Entity::Endpoint(e), AttrClass::Config) => {
                let mut map = Map::new();
                map.insert("host".into(), serde_json::to_value(&e.host)?);
                map.insert("port".into(), serde_json::to_value(e.port)?);
                map.insert("features".into(), serde_json::to_value(&e.features)?);
                Value::Object(map)
            }
            (Entity::Endpoint(e), AttrClass::State) => {
                let mut map = Map::new();
                map.insert("state".into(), serde_json::to_value(&e.state)?);
                Value::Object(map)
            }
            (Entity::Zone(z), AttrClass::Config) => serde_json::to_value(z)?,
            _ => Value::Object(Map::new()),
        };
        Ok(value)
    }

    /// Serializes the state-class attributes for snapshotting and replication.
    pub fn state_value(&self) -> Result<Value, VigilError> {
        self.class_value(AttrClass::State)
    }

    /// Serializes the config-class attributes, the payload of idempotent
    /// config replication.
    pub fn config_value(&self) -> Result<Value, VigilError> {
        self.class_value(AttrClass::Config)
    }

    /// Restores state-class attributes from a snapshot value. Idempotent;
    /// config-class attributes are untouched.
    pub fn apply_state(&mut self, value: Value) -> Result<(), VigilError> {
        match self {
            Entity::Host(h) => h.state = serde_json::from_value(value)?,
            Entity::Service(s) => s.state = serde_json::from_value(value)?,
            Entity::Comment(c) => *c = serde_json::from_value(value)?,
            Entity::Downtime(d) => *d = serde_json::from_value(value)?,
            Entity::Endpoint(e) => {
                let mut map = as_object(value);
                if let Some(state) = map.remove("state") {
                    e.state = serde_json::from_value(state)?;
                }
            }
            Entity::Zone(_) => {}
        }
        Ok(())
    }

    /// Rebuilds a runtime-created entity (comment, downtime) from its
    /// persisted state. Config-backed kinds return `None`; they are re-read
    /// from the config source instead.
    pub fn from_persisted_state(kind: ObjectKind, state: &Value) -> Option<Entity> {
        match kind {
            ObjectKind::Comment => serde_json::from_value(state.clone())
                .ok()
                .map(Entity::Comment),
            ObjectKind::Downtime => serde_json::from_value(state.clone())
                .ok()
                .map(Entity::Downtime),
            _ => None,
        }
    }

    /// The checkable a runtime-created entity is parented to.
    pub fn parent_checkable(&self) -> Option<ObjectKey> {
        match self {
            Entity::Comment(c) => Some(c.checkable.clone()),
            Entity::Downtime(d) => Some(d.checkable.clone()),
            _ => None,
        }
    }

    /// Reads one attribute by name, validated against the type schema.
    pub fn get_attr(&self, name: &str) -> Result<Value, VigilError> {
        let spec = find_attr(Self::schema(self.kind()), name).ok_or_else(|| {
            VigilError::UnknownAttribute {
                kind: self.kind().to_string(),
                attr: name.to_string(),
            }
        })?;
        let bucket = self.class_value(spec.class)?;
        Ok(bucket.get(name).cloned().unwrap_or_else(|| (spec.default)()))
    }

    /// Writes one attribute by name. Config-class attributes are immutable
    /// after load. Returns the previous value.
    pub fn set_attr(&mut self, name: &str, value: Value) -> Result<Value, VigilError> {
        let spec = find_attr(Self::schema(self.kind()), name).ok_or_else(|| {
            VigilError::UnknownAttribute {
                kind: self.kind().to_string(),
                attr: name.to_string(),
            }
        })?;
        if spec.class == AttrClass::Config {
            return Err(VigilError::ImmutableAttribute(name.to_string()));
        }
        let mut bucket = as_object(self.class_value(spec.class)?);
        let old = bucket
            .insert(name.to_string(), value)
            .unwrap_or_else(|| (spec.default)());
        let merged = Value::Object(bucket);
        match spec.class {
            AttrClass::State => self.apply_state(merged)?,
            AttrClass::Runtime => self.apply_runtime(merged)?,
            AttrClass::Config => unreachable!(),
        }
        Ok(old)
    }

    fn apply_runtime(&mut self, value: Value) -> Result<(), VigilError> {
        match self {
            Entity::Host(h) => h.runtime = serde_json::from_value(value)?,
            Entity::Service(s) => s.runtime = serde_json::from_value(value)?,
            _ => {}
        }
        Ok(())
    }
}

fn as_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => Map::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::checkresult::CheckState;
    use serde_json::json;

    fn sample_host() -> Entity {
        Entity::Host(Host::new(CheckableConfig::default(), vec!["gw".into()]))
    }

    #[test]
    fn get_attr_covers_all_classes() {
        let host = sample_host();
        assert_eq!(host.get_attr("parents").unwrap(), json!(["gw"]));
        assert_eq!(host.get_attr("state").unwrap(), json!("up"));
        assert_eq!(host.get_attr("executing").unwrap(), json!(false));
        assert!(host.get_attr("bogus").is_err());
    }

    #[test]
    fn set_attr_rejects_config_class() {
        let mut host = sample_host();
        let err = host.set_attr("check_interval", json!(10.0)).unwrap_err();
        assert!(matches!(err, VigilError::ImmutableAttribute(_)));
    }

    #[test]
    fn set_attr_roundtrips_state() {
        let mut host = sample_host();
        let old = host.set_attr("state", json!("down")).unwrap();
        assert_eq!(old, json!("up"));
        assert_eq!(host.as_host().unwrap().state.state, CheckState::Down);
    }

    #[test]
    fn state_roundtrip_preserves_config() {
        let mut host = sample_host();
        host.set_attr("state", json!("down")).unwrap();
        let snapshot = host.state_value().unwrap();

        let mut restored = sample_host();
        restored.apply_state(snapshot.clone()).unwrap();
        assert_eq!(restored.state_value().unwrap(), snapshot);
        assert_eq!(restored.as_host().unwrap().parents, vec!["gw".to_string()]);
    }
}
