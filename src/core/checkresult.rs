// src/core/checkresult.rs

//! The immutable outcome of one check execution, plus the state enums shared
//! by hosts and services.

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// The value produced by a check.
///
/// Hosts use the `Up`/`Down` variants (`Unreachable` is derived from parent
/// reachability at read time, never produced by a plugin); services use
/// `Ok`/`Warning`/`Critical`/`Unknown`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CheckState {
    #[default]
    Ok,
    Warning,
    Critical,
    Unknown,
    Up,
    Down,
    Unreachable,
}

impl CheckState {
    /// Whether this state counts as healthy for notification and attempt logic.
    pub fn is_ok(&self) -> bool {
        matches!(self, CheckState::Ok | CheckState::Up)
    }

    pub fn is_problem(&self) -> bool {
        !self.is_ok()
    }

    /// Maps a plugin exit status onto a service state.
    pub fn from_service_exit(status: i32) -> Self {
        match status {
            0 => CheckState::Ok,
            1 => CheckState::Warning,
            2 => CheckState::Critical,
            _ => CheckState::Unknown,
        }
    }

    /// Maps a plugin exit status onto a host state. Anything non-zero is a
    /// hard `Down`; unreachability is derived from parents, not exit codes.
    pub fn from_host_exit(status: i32) -> Self {
        if status == 0 { CheckState::Up } else { CheckState::Down }
    }
}

/// Soft states are transient attempts; hard is the confirmed state external
/// observers act on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, Default,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum StateType {
    Soft,
    #[default]
    Hard,
}

/// A snapshot of the interesting scheduling state of a checkable, captured at
/// entry and exit of a state transition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub state: CheckState,
    pub state_type: StateType,
    pub attempt: u32,
    pub reachable: bool,
}

/// The immutable outcome of one check execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub schedule_start: f64,
    pub schedule_end: f64,
    pub execution_start: f64,
    pub execution_end: f64,
    pub exit_status: i32,
    /// First line of the plugin output.
    pub output: String,
    /// Everything after the first line.
    #[serde(default)]
    pub long_output: String,
    #[serde(default)]
    pub performance_data: String,
    pub state: CheckState,
    /// The endpoint that produced this result.
    pub check_source: String,
    #[serde(default)]
    pub vars_before: Option<StateSnapshot>,
    #[serde(default)]
    pub vars_after: Option<StateSnapshot>,
}

impl CheckResult {
    /// Scheduling latency: time spent waiting minus time spent executing,
    /// clamped to zero.
    pub fn latency(&self) -> f64 {
        let total = self.schedule_end - self.schedule_start;
        let execution = self.execution_end - self.execution_start;
        (total - execution).max(0.0)
    }

    pub fn execution_time(&self) -> f64 {
        (self.execution_end - self.execution_start).max(0.0)
    }
}

/// Splits raw plugin output into `(first line, remainder, perfdata)`.
///
/// The conventional plugin format is `output | perfdata` on the first line,
/// with optional long output on subsequent lines.
pub fn parse_plugin_output(raw: &str) -> (String, String, String) {
    let mut lines = raw.lines();
    let first = lines.next().unwrap_or("");
    let (output, perfdata) = match first.split_once('|') {
        Some((text, perf)) => (text.trim().to_string(), perf.trim().to_string()),
        None => (first.trim().to_string(), String::new()),
    };
    let long_output = lines.collect::<Vec<_>>().join("\n");
    (output, long_output, perfdata)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_is_clamped_non_negative() {
        let cr = CheckResult {
            schedule_start: 100.0,
            schedule_end: 101.0,
            execution_start: 100.0,
            execution_end: 102.5,
            exit_status: 0,
            output: String::new(),
            long_output: String::new(),
            performance_data: String::new(),
            state: CheckState::Ok,
            check_source: "node-a".into(),
            vars_before: None,
            vars_after: None,
        };
        assert_eq!(cr.latency(), 0.0);
        assert_eq!(cr.execution_time(), 2.5);
    }

    #[test]
    fn plugin_output_splits_perfdata_and_long_output() {
        let (out, long, perf) = parse_plugin_output("DISK OK | /=2000MB;;;0\nall volumes healthy");
        assert_eq!(out, "DISK OK");
        assert_eq!(long, "all volumes healthy");
        assert_eq!(perf, "/=2000MB;;;0");
    }

    #[test]
    fn exit_status_mapping() {
        assert_eq!(CheckState::from_service_exit(0), CheckState::Ok);
        assert_eq!(CheckState::from_service_exit(2), CheckState::Critical);
        assert_eq!(CheckState::from_service_exit(42), CheckState::Unknown);
        assert_eq!(CheckState::from_host_exit(0), CheckState::Up);
        assert_eq!(CheckState::from_host_exit(1), CheckState::Down);
    }
}
