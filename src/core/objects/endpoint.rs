// src/core/objects/endpoint.rs

//! Endpoints (peer identities) and zones (groups of mutually authoritative
//! endpoints).

use serde::{Deserialize, Serialize};

use crate::core::objects::schema::{self, AttrClass, AttrSpec};

/// State-class attributes of an endpoint: last contact and the replication
/// bookmarks (see the replay log).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EndpointState {
    /// Unix timestamp of the last message received from this peer.
    pub seen: f64,
    /// Highest journal timestamp already sent to this peer.
    pub local_log_position: f64,
    /// Highest journal timestamp this peer has acknowledged.
    pub remote_log_position: f64,
}

/// A peer identity. The name must equal the peer certificate's CN.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Endpoint {
    /// Connect address; peers without one are only ever accepted inbound.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Features this peer accepts (`checker`, `notifier`).
    #[serde(default)]
    pub features: Vec<String>,
    #[serde(default)]
    pub state: EndpointState,
}

impl Endpoint {
    pub fn connect_addr(&self) -> Option<(String, u16)> {
        match (&self.host, self.port) {
            (Some(host), Some(port)) => Some((host.clone(), port)),
            _ => None,
        }
    }
}

/// A named group of endpoints. Zones form a tree rooted at the local zone;
/// parent/child relations bound the replication direction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Zone {
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

pub fn endpoint_schema() -> &'static [AttrSpec] {
    const SCHEMA: &[AttrSpec] = &[
        AttrSpec::new("host", AttrClass::Config, schema::d_null),
        AttrSpec::new("port", AttrClass::Config, schema::d_null),
        AttrSpec::new("features", AttrClass::Config, schema::d_list),
        AttrSpec::new("state", AttrClass::State, schema::d_null),
    ];
    SCHEMA
}

pub fn zone_schema() -> &'static [AttrSpec] {
    const SCHEMA: &[AttrSpec] = &[
        AttrSpec::new("endpoints", AttrClass::Config, schema::d_list),
        AttrSpec::new("parent", AttrClass::Config, schema::d_null),
    ];
    SCHEMA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_addr_requires_both_parts() {
        let mut ep = Endpoint::default();
        assert!(ep.connect_addr().is_none());
        ep.host = Some("10.0.0.2".into());
        assert!(ep.connect_addr().is_none());
        ep.port = Some(5665);
        assert_eq!(ep.connect_addr(), Some(("10.0.0.2".into(), 5665)));
    }
}
