// src/core/objects/checkable.rs

//! Hosts and services: the shared checkable attribute set and its two
//! concrete variants.
//!
//! `Host` and `Service` are distinct entity variants that embed the same
//! config/state/runtime blocks by composition; only parenting and
//! reachability rules differ between them.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::core::checkresult::{CheckResult, CheckState, StateType};
use crate::core::objects::schema::{self, AttrClass, AttrSpec};
use crate::core::timeperiod::TimePeriod;

/// Acknowledgement kinds. `Normal` clears on any state change, `Sticky`
/// survives until recovery or expiry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum AckType {
    #[default]
    None,
    Normal,
    Sticky,
}

/// Config-class attributes shared by hosts and services. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckableConfig {
    /// Name of the external check definition to run.
    pub check_command: String,
    /// Seconds between checks in a steady state.
    pub check_interval: f64,
    /// Seconds between checks while in a soft problem state.
    pub retry_interval: f64,
    /// Attempts before a problem state is confirmed hard.
    pub max_check_attempts: u32,
    #[serde(default)]
    pub check_period: TimePeriod,
    #[serde(default)]
    pub notification_period: TimePeriod,
    /// Seconds between problem re-notifications; `0` disables reminders.
    #[serde(default)]
    pub notification_interval: f64,
    /// The zone that owns this object.
    #[serde(default)]
    pub zone: String,
    #[serde(default = "default_high_flap_threshold")]
    pub high_flap_threshold: f64,
    #[serde(default = "default_low_flap_threshold")]
    pub low_flap_threshold: f64,
}

pub fn default_high_flap_threshold() -> f64 {
    30.0
}
pub fn default_low_flap_threshold() -> f64 {
    25.0
}

impl Default for CheckableConfig {
    fn default() -> Self {
        Self {
            check_command: String::new(),
            check_interval: 300.0,
            retry_interval: 60.0,
            max_check_attempts: 3,
            check_period: TimePeriod::default(),
            notification_period: TimePeriod::default(),
            notification_interval: 0.0,
            zone: String::new(),
            high_flap_threshold: default_high_flap_threshold(),
            low_flap_threshold: default_low_flap_threshold(),
        }
    }
}

/// State-class attributes: persisted across restarts and replicated to peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckableState {
    pub state: CheckState,
    pub state_type: StateType,
    pub current_attempt: u32,
    pub last_state_change: f64,
    pub last_hard_state_change: f64,
    pub next_check: f64,
    pub last_check_end: f64,
    pub last_check_result: Option<CheckResult>,
    /// Weighted transition ratio over the flap window, in percent.
    pub flapping_current: f64,
    pub flapping: bool,
    /// Sliding window of "state changed" flags, newest last.
    pub flap_history: Vec<bool>,
    pub acknowledgement: AckType,
    /// Unix timestamp; `0` means no expiry.
    pub acknowledgement_expiry: f64,
    pub in_downtime_depth: u32,
    pub enable_active_checks: bool,
    pub enable_passive_checks: bool,
    pub enable_notifications: bool,
    pub enable_flapping: bool,
    /// One-shot flag: run the next check even outside the check period.
    pub force_next_check: bool,
    /// When the current problem was last notified; reset on hard state change.
    pub last_problem_notification: f64,
}

impl Default for CheckableState {
    fn default() -> Self {
        Self {
            state: CheckState::Ok,
            state_type: StateType::Hard,
            current_attempt: 1,
            last_state_change: 0.0,
            last_hard_state_change: 0.0,
            next_check: 0.0,
            last_check_end: 0.0,
            last_check_result: None,
            flapping_current: 0.0,
            flapping: false,
            flap_history: Vec::new(),
            acknowledgement: AckType::None,
            acknowledgement_expiry: 0.0,
            in_downtime_depth: 0,
            enable_active_checks: true,
            enable_passive_checks: true,
            enable_notifications: true,
            enable_flapping: true,
            force_next_check: false,
            last_problem_notification: 0.0,
        }
    }
}

impl CheckableState {
    /// Whether an acknowledgement is currently in effect.
    pub fn is_acknowledged(&self, now: f64) -> bool {
        self.acknowledgement != AckType::None
            && (self.acknowledgement_expiry == 0.0 || self.acknowledgement_expiry > now)
    }
}

/// Volatile, local-only attributes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckableRuntime {
    /// A check is currently in flight for this object.
    pub executing: bool,
}

/// A monitored host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Host {
    #[serde(flatten)]
    pub config: CheckableConfig,
    /// Names of parent hosts; the host is unreachable while any parent is
    /// known non-up.
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub state: CheckableState,
    #[serde(skip)]
    pub runtime: CheckableRuntime,
}

impl Host {
    pub fn new(config: CheckableConfig, parents: Vec<String>) -> Self {
        let mut state = CheckableState::default();
        state.state = CheckState::Up;
        Self {
            config,
            parents,
            state,
            runtime: CheckableRuntime::default(),
        }
    }

    /// The externally visible state: `Unreachable` when a parent is down,
    /// otherwise the stored state.
    pub fn visible_state(&self, reachable: bool) -> CheckState {
        if !reachable && self.state.state == CheckState::Down {
            CheckState::Unreachable
        } else {
            self.state.state
        }
    }
}

/// A monitored service, owned by a host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    /// Back-reference to the owning host, by name.
    pub host_name: String,
    #[serde(flatten)]
    pub config: CheckableConfig,
    #[serde(default)]
    pub state: CheckableState,
    #[serde(skip)]
    pub runtime: CheckableRuntime,
}

impl Service {
    pub fn new(host_name: String, config: CheckableConfig) -> Self {
        Self {
            host_name,
            config,
            state: CheckableState::default(),
            runtime: CheckableRuntime::default(),
        }
    }
}

const SHARED_CONFIG_ATTRS: &[AttrSpec] = &[
    AttrSpec::new("check_command", AttrClass::Config, schema::d_string),
    AttrSpec::new("check_interval", AttrClass::Config, schema::d_zero),
    AttrSpec::new("retry_interval", AttrClass::Config, schema::d_zero),
    AttrSpec::new("max_check_attempts", AttrClass::Config, schema::d_one),
    AttrSpec::new("check_period", AttrClass::Config, schema::d_list),
    AttrSpec::new("notification_period", AttrClass::Config, schema::d_list),
    AttrSpec::new("notification_interval", AttrClass::Config, schema::d_zero),
    AttrSpec::new("zone", AttrClass::Config, schema::d_string),
    AttrSpec::new("high_flap_threshold", AttrClass::Config, schema::d_zero),
    AttrSpec::new("low_flap_threshold", AttrClass::Config, schema::d_zero),
];

const SHARED_STATE_ATTRS: &[AttrSpec] = &[
    AttrSpec::new("state", AttrClass::State, schema::d_string),
    AttrSpec::new("state_type", AttrClass::State, schema::d_string),
    AttrSpec::new("current_attempt", AttrClass::State, schema::d_one),
    AttrSpec::new("last_state_change", AttrClass::State, schema::d_zero),
    AttrSpec::new("last_hard_state_change", AttrClass::State, schema::d_zero),
    AttrSpec::new("next_check", AttrClass::State, schema::d_zero),
    AttrSpec::new("last_check_end", AttrClass::State, schema::d_zero),
    AttrSpec::new("last_check_result", AttrClass::State, schema::d_null),
    AttrSpec::new("flapping_current", AttrClass::State, schema::d_zero),
    AttrSpec::new("flapping", AttrClass::State, schema::d_false),
    AttrSpec::new("flap_history", AttrClass::State, schema::d_list),
    AttrSpec::new("acknowledgement", AttrClass::State, schema::d_string),
    AttrSpec::new("acknowledgement_expiry", AttrClass::State, schema::d_zero),
    AttrSpec::new("in_downtime_depth", AttrClass::State, schema::d_zero),
    AttrSpec::new("enable_active_checks", AttrClass::State, schema::d_true),
    AttrSpec::new("enable_passive_checks", AttrClass::State, schema::d_true),
    AttrSpec::new("enable_notifications", AttrClass::State, schema::d_true),
    AttrSpec::new("enable_flapping", AttrClass::State, schema::d_true),
    AttrSpec::new("force_next_check", AttrClass::State, schema::d_false),
    AttrSpec::new("last_problem_notification", AttrClass::State, schema::d_zero),
];

const RUNTIME_ATTRS: &[AttrSpec] = &[AttrSpec::new("executing", AttrClass::Runtime, schema::d_false)];

macro_rules! concat_schema {
    ($name:ident, $extra:expr) => {
        pub fn $name() -> &'static [AttrSpec] {
            use once_cell::sync::Lazy;
            static SCHEMA: Lazy<Vec<AttrSpec>> = Lazy::new(|| {
                let mut all: Vec<AttrSpec> = Vec::new();
                all.extend(
                    $extra
                        .iter()
                        .map(|s: &AttrSpec| AttrSpec::new(s.name, s.class, s.default)),
                );
                all.extend(
                    SHARED_CONFIG_ATTRS
                        .iter()
                        .chain(SHARED_STATE_ATTRS.iter())
                        .chain(RUNTIME_ATTRS.iter())
                        .map(|s| AttrSpec::new(s.name, s.class, s.default)),
                );
                all
            });
            &SCHEMA
        }
    };
}

concat_schema!(
    host_schema,
    [AttrSpec::new("parents", AttrClass::Config, schema::d_list)]
);
concat_schema!(
    service_schema,
    [AttrSpec::new("host_name", AttrClass::Config, schema::d_string)]
);
