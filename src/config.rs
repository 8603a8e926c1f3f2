// src/config.rs

//! Manages engine configuration: loading, environment overrides, validation,
//! and the declarative entity tables the object runtime is seeded from.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use crate::core::checker::executor::CheckCommand;
use crate::core::objects::checkable::{
    CheckableConfig, default_high_flap_threshold, default_low_flap_threshold,
};
use crate::core::timeperiod::TimePeriod;

/// Environment variables honored for drop-in compatibility with the
/// ecosystem's deployment tooling.
pub const ENV_CONFIG_FILE: &str = "ICINGA_CONFIG_FILE";
pub const ENV_STATE_DIR: &str = "ICINGA_STATE_DIR";
pub const ENV_LOG_DIR: &str = "ICINGA_LOG_DIR";

/// Node identity and filesystem layout.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EngineConfig {
    /// Must equal the CN of the local TLS certificate.
    pub node_name: String,
    /// The local zone; must list `node_name` as an endpoint.
    pub zone: String,
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Defaults to `<state_dir>/log`.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_state_dir() -> String {
    "vigil_data".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Check scheduler knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_concurrent_checks")]
    pub max_concurrent_checks: usize,
    /// Deadline for check commands that do not declare their own.
    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub check_timeout: Duration,
}

fn default_max_concurrent_checks() -> usize {
    512
}
fn default_check_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_checks: default_max_concurrent_checks(),
            check_timeout: default_check_timeout(),
        }
    }
}

/// Peer transport knobs.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ClusterConfig {
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    #[serde(default = "default_bind_port")]
    pub bind_port: u16,
    /// Links carrying larger frames are dropped.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    #[serde(default = "default_heartbeat_interval", with = "humantime_serde")]
    pub heartbeat_interval: Duration,
    #[serde(default = "default_reconnect_max_delay", with = "humantime_serde")]
    pub reconnect_max_delay: Duration,
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}
fn default_bind_port() -> u16 {
    5665
}
fn default_max_message_size() -> usize {
    64 * 1024 * 1024 // 64 MiB
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_reconnect_max_delay() -> Duration {
    Duration::from_secs(60)
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            bind_port: default_bind_port(),
            max_message_size: default_max_message_size(),
            heartbeat_interval: default_heartbeat_interval(),
            reconnect_max_delay: default_reconnect_max_delay(),
        }
    }
}

/// Replay-log segmentation and retention.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JournalConfig {
    #[serde(default = "default_segment_max_bytes")]
    pub segment_max_bytes: u64,
    #[serde(default = "default_retention", with = "humantime_serde")]
    pub retention: Duration,
}

fn default_segment_max_bytes() -> u64 {
    50 * 1024 * 1024 // 50 MB
}
fn default_retention() -> Duration {
    Duration::from_secs(7 * 24 * 3600) // 7 days
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            segment_max_bytes: default_segment_max_bytes(),
            retention: default_retention(),
        }
    }
}

/// Engine-wide flap detection thresholds; per-checkable overrides win.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct FlappingConfig {
    #[serde(default = "default_high_flap_threshold")]
    pub high_threshold: f64,
    #[serde(default = "default_low_flap_threshold")]
    pub low_threshold: f64,
}

impl Default for FlappingConfig {
    fn default() -> Self {
        Self {
            high_threshold: default_high_flap_threshold(),
            low_threshold: default_low_flap_threshold(),
        }
    }
}

/// TLS material for peer authentication.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TlsConfig {
    #[serde(default = "default_ca_path")]
    pub ca_path: String,
    #[serde(default)]
    pub cert_path: String,
    #[serde(default)]
    pub key_path: String,
}

fn default_ca_path() -> String {
    "certs/ca.crt".to_string()
}

/// Shared checkable attributes as they appear in the config tables.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CheckableDef {
    pub check_command: String,
    #[serde(default = "default_check_interval")]
    pub check_interval: f64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval: f64,
    #[serde(default = "default_max_check_attempts")]
    pub max_check_attempts: u32,
    #[serde(default)]
    pub check_period: TimePeriod,
    #[serde(default)]
    pub notification_period: TimePeriod,
    #[serde(default)]
    pub notification_interval: f64,
    /// Owning zone; defaults to the local zone.
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub high_flap_threshold: Option<f64>,
    #[serde(default)]
    pub low_flap_threshold: Option<f64>,
}

fn default_check_interval() -> f64 {
    300.0
}
fn default_retry_interval() -> f64 {
    60.0
}
fn default_max_check_attempts() -> u32 {
    3
}

impl CheckableDef {
    /// Resolves defaults into the runtime attribute block.
    pub fn resolve(&self, local_zone: &str, flapping: &FlappingConfig) -> CheckableConfig {
        CheckableConfig {
            check_command: self.check_command.clone(),
            check_interval: self.check_interval,
            retry_interval: self.retry_interval,
            max_check_attempts: self.max_check_attempts,
            check_period: self.check_period.clone(),
            notification_period: self.notification_period.clone(),
            notification_interval: self.notification_interval,
            zone: self
                .zone
                .clone()
                .unwrap_or_else(|| local_zone.to_string()),
            high_flap_threshold: self.high_flap_threshold.unwrap_or(flapping.high_threshold),
            low_flap_threshold: self.low_flap_threshold.unwrap_or(flapping.low_threshold),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostDef {
    pub name: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(flatten)]
    pub checkable: CheckableDef,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServiceDef {
    pub name: String,
    pub host: String,
    #[serde(flatten)]
    pub checkable: CheckableDef,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EndpointDef {
    pub name: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Features this peer accepts; empty accepts all.
    #[serde(default)]
    pub features: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ZoneDef {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
}

/// A raw representation of the config file before validation.
#[derive(Deserialize)]
struct RawConfig {
    engine: EngineConfig,
    #[serde(default)]
    scheduler: SchedulerConfig,
    #[serde(default)]
    cluster: ClusterConfig,
    #[serde(default)]
    journal: JournalConfig,
    #[serde(default)]
    flapping: FlappingConfig,
    #[serde(default)]
    tls: TlsConfig,
    #[serde(default)]
    check_commands: Vec<CheckCommand>,
    #[serde(default)]
    hosts: Vec<HostDef>,
    #[serde(default)]
    services: Vec<ServiceDef>,
    #[serde(default)]
    endpoints: Vec<EndpointDef>,
    #[serde(default)]
    zones: Vec<ZoneDef>,
}

/// The final, validated engine configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    pub engine: EngineConfig,
    pub scheduler: SchedulerConfig,
    pub cluster: ClusterConfig,
    pub journal: JournalConfig,
    pub flapping: FlappingConfig,
    pub tls: TlsConfig,
    pub check_commands: Vec<CheckCommand>,
    pub hosts: Vec<HostDef>,
    pub services: Vec<ServiceDef>,
    pub endpoints: Vec<EndpointDef>,
    pub zones: Vec<ZoneDef>,
}

impl Config {
    /// Creates a new `Config` by reading and parsing a TOML file, applying
    /// environment overrides, and validating the result.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let mut config = Config {
            engine: raw.engine,
            scheduler: raw.scheduler,
            cluster: raw.cluster,
            journal: raw.journal,
            flapping: raw.flapping,
            tls: raw.tls,
            check_commands: raw.check_commands,
            hosts: raw.hosts,
            services: raw.services,
            endpoints: raw.endpoints,
            zones: raw.zones,
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = env::var(ENV_STATE_DIR)
            && !dir.trim().is_empty()
        {
            self.engine.state_dir = dir;
        }
        if let Ok(dir) = env::var(ENV_LOG_DIR)
            && !dir.trim().is_empty()
        {
            self.engine.log_dir = Some(dir);
        }
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.engine.node_name.trim().is_empty() {
            return Err(anyhow!("engine.node_name cannot be empty"));
        }
        if self.engine.zone.trim().is_empty() {
            return Err(anyhow!("engine.zone cannot be empty"));
        }
        if self.cluster.bind_port == 0 {
            return Err(anyhow!("cluster.bind_port cannot be 0"));
        }
        if self.scheduler.max_concurrent_checks == 0 {
            return Err(anyhow!("scheduler.max_concurrent_checks cannot be 0"));
        }
        if self.journal.segment_max_bytes == 0 {
            return Err(anyhow!("journal.segment_max_bytes cannot be 0"));
        }
        if self.flapping.low_threshold > self.flapping.high_threshold {
            return Err(anyhow!(
                "flapping.low_threshold must not exceed flapping.high_threshold"
            ));
        }

        let local_zone = self
            .zones
            .iter()
            .find(|zone| zone.name == self.engine.zone)
            .ok_or_else(|| anyhow!("engine.zone '{}' is not declared in zones", self.engine.zone))?;
        if !local_zone.endpoints.contains(&self.engine.node_name) {
            return Err(anyhow!(
                "zone '{}' does not list the local endpoint '{}'",
                self.engine.zone,
                self.engine.node_name
            ));
        }

        let endpoint_names: HashSet<&str> =
            self.endpoints.iter().map(|ep| ep.name.as_str()).collect();
        if endpoint_names.len() != self.endpoints.len() {
            return Err(anyhow!("duplicate endpoint names"));
        }
        if !endpoint_names.contains(self.engine.node_name.as_str()) {
            return Err(anyhow!(
                "the local endpoint '{}' must be declared in endpoints",
                self.engine.node_name
            ));
        }
        let zone_names: HashSet<&str> = self.zones.iter().map(|z| z.name.as_str()).collect();
        if zone_names.len() != self.zones.len() {
            return Err(anyhow!("duplicate zone names"));
        }
        for zone in &self.zones {
            for member in &zone.endpoints {
                if !endpoint_names.contains(member.as_str()) {
                    return Err(anyhow!(
                        "zone '{}' references unknown endpoint '{}'",
                        zone.name,
                        member
                    ));
                }
            }
            if let Some(parent) = &zone.parent
                && !zone_names.contains(parent.as_str())
            {
                return Err(anyhow!(
                    "zone '{}' references unknown parent zone '{}'",
                    zone.name,
                    parent
                ));
            }
        }

        let command_names: HashSet<&str> = self
            .check_commands
            .iter()
            .map(|cmd| cmd.name.as_str())
            .collect();
        if command_names.len() != self.check_commands.len() {
            return Err(anyhow!("duplicate check command names"));
        }

        let host_names: HashSet<&str> = self.hosts.iter().map(|h| h.name.as_str()).collect();
        if host_names.len() != self.hosts.len() {
            return Err(anyhow!("duplicate host names"));
        }
        let mut service_keys = HashSet::new();
        for service in &self.services {
            if !host_names.contains(service.host.as_str()) {
                return Err(anyhow!(
                    "service '{}' references unknown host '{}'",
                    service.name,
                    service.host
                ));
            }
            if !service_keys.insert((service.host.as_str(), service.name.as_str())) {
                return Err(anyhow!(
                    "duplicate service '{}' on host '{}'",
                    service.name,
                    service.host
                ));
            }
        }
        for (name, def) in self
            .hosts
            .iter()
            .map(|h| (h.name.as_str(), &h.checkable))
            .chain(self.services.iter().map(|s| (s.name.as_str(), &s.checkable)))
        {
            if !command_names.contains(def.check_command.as_str()) {
                return Err(anyhow!(
                    "'{}' references unknown check command '{}'",
                    name,
                    def.check_command
                ));
            }
            if def.check_interval <= 0.0 || def.retry_interval <= 0.0 {
                return Err(anyhow!("'{}': check intervals must be positive", name));
            }
            if def.max_check_attempts == 0 {
                return Err(anyhow!("'{}': max_check_attempts must be at least 1", name));
            }
            if let Some(zone) = &def.zone
                && !zone_names.contains(zone.as_str())
            {
                return Err(anyhow!("'{}' references unknown zone '{}'", name, zone));
            }
            def.check_period
                .validate()
                .with_context(|| format!("invalid check_period on '{name}'"))?;
            def.notification_period
                .validate()
                .with_context(|| format!("invalid notification_period on '{name}'"))?;
        }
        for host in &self.hosts {
            for parent in &host.parents {
                if !host_names.contains(parent.as_str()) {
                    return Err(anyhow!(
                        "host '{}' references unknown parent '{}'",
                        host.name,
                        parent
                    ));
                }
            }
        }

        let has_remote_peers = self
            .endpoints
            .iter()
            .any(|ep| ep.name != self.engine.node_name);
        if has_remote_peers
            && (self.tls.cert_path.trim().is_empty() || self.tls.key_path.trim().is_empty())
        {
            return Err(anyhow!(
                "tls.cert_path and tls.key_path are required when remote endpoints are configured"
            ));
        }
        Ok(())
    }

    pub fn state_dir(&self) -> PathBuf {
        PathBuf::from(&self.engine.state_dir)
    }

    pub fn state_file(&self) -> PathBuf {
        self.state_dir().join("state.dat")
    }

    pub fn bookmarks_file(&self) -> PathBuf {
        self.state_dir().join("bookmarks.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        match &self.engine.log_dir {
            Some(dir) => PathBuf::from(dir),
            None => self.state_dir().join("log"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn local_zone_must_list_local_endpoint() {
        let mut config = Config::default();
        config.zones[0].endpoints.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn services_must_reference_known_hosts() {
        let mut config = Config::default();
        config.services.push(ServiceDef {
            name: "http".into(),
            host: "ghost".into(),
            checkable: CheckableDef {
                check_command: "ping".into(),
                check_interval: default_check_interval(),
                retry_interval: default_retry_interval(),
                max_check_attempts: default_max_check_attempts(),
                check_period: TimePeriod::default(),
                notification_period: TimePeriod::default(),
                notification_interval: 0.0,
                zone: None,
                high_flap_threshold: None,
                low_flap_threshold: None,
            },
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn remote_peers_require_tls_material() {
        let mut config = Config::default();
        config.endpoints.push(EndpointDef {
            name: "node-b".into(),
            host: Some("10.0.0.2".into()),
            port: Some(5665),
            features: vec![],
        });
        assert!(config.validate().is_err());
        config.tls.cert_path = "certs/node-a.crt".into();
        config.tls.key_path = "certs/node-a.key".into();
        config.validate().unwrap();
    }

    #[test]
    fn from_file_applies_section_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[engine]
node_name = "node-a"
zone = "primary"

[[check_commands]]
name = "ping"
command = "/usr/lib/monitoring/check_ping"
timeout = "30s"

[[hosts]]
name = "web1"
check_command = "ping"
check_interval = 60.0

[[endpoints]]
name = "node-a"

[[zones]]
name = "primary"
endpoints = ["node-a"]
"#
        )
        .unwrap();
        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.scheduler.max_concurrent_checks, 512);
        assert_eq!(config.journal.segment_max_bytes, 50 * 1024 * 1024);
        assert_eq!(config.cluster.bind_port, 5665);
        assert_eq!(config.hosts[0].checkable.check_interval, 60.0);
        assert_eq!(config.hosts[0].checkable.max_check_attempts, 3);
        assert_eq!(
            config.check_commands[0].timeout,
            Some(std::time::Duration::from_secs(30))
        );
    }
}

impl Default for Config {
    /// A minimal single-node configuration, as used by the test harness.
    fn default() -> Self {
        Config {
            engine: EngineConfig {
                node_name: "node-a".into(),
                zone: "primary".into(),
                state_dir: default_state_dir(),
                log_dir: None,
                log_level: default_log_level(),
            },
            scheduler: SchedulerConfig::default(),
            cluster: ClusterConfig::default(),
            journal: JournalConfig::default(),
            flapping: FlappingConfig::default(),
            tls: TlsConfig::default(),
            check_commands: vec![CheckCommand {
                name: "ping".into(),
                command: "/bin/true".into(),
                args: vec![],
                timeout: None,
            }],
            hosts: vec![],
            services: vec![],
            endpoints: vec![EndpointDef {
                name: "node-a".into(),
                host: None,
                port: None,
                features: vec![],
            }],
            zones: vec![ZoneDef {
                name: "primary".into(),
                endpoints: vec!["node-a".into()],
                parent: None,
            }],
        }
    }
}
