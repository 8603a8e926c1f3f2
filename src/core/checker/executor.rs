// src/core/checker/executor.rs

//! Check execution: the plugin-runner seam and the synthesis of CheckResults
//! from plugin outcomes, timeouts and launch failures.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::core::VigilError;
use crate::core::checkresult::{CheckResult, CheckState, parse_plugin_output};
use crate::core::now_ts;
use crate::core::objects::key::{ObjectKey, ObjectKind};

/// An external check definition, resolved by name from the configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckCommand {
    pub name: String,
    /// The plugin binary to execute.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Per-command deadline; the engine-wide default applies when absent.
    #[serde(default, with = "humantime_serde::option")]
    pub timeout: Option<Duration>,
}

/// Raw outcome of one plugin invocation.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    pub exit_status: i32,
    pub stdout: String,
}

/// The seam to the external process runner. Production uses `PluginRunner`;
/// tests substitute deterministic fakes.
#[async_trait]
pub trait CheckRunner: Send + Sync {
    async fn run(&self, command: &CheckCommand) -> Result<PluginOutput, VigilError>;
}

/// Spawns the plugin as a child process and captures exit code and stdout.
#[derive(Debug, Default)]
pub struct PluginRunner;

#[async_trait]
impl CheckRunner for PluginRunner {
    async fn run(&self, command: &CheckCommand) -> Result<PluginOutput, VigilError> {
        let output = Command::new(&command.command)
            .args(&command.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                VigilError::TransientIo(format!("failed to launch '{}': {e}", command.command))
            })?;
        // A signal-killed plugin reports no code; treat it as unknown.
        let exit_status = output.status.code().unwrap_or(3);
        Ok(PluginOutput {
            exit_status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        })
    }
}

/// The state a synthetic (timeout / launch failure) result carries. Host
/// states have no `unknown`, so hosts degrade to `down`.
fn synthetic_state(kind: ObjectKind) -> CheckState {
    match kind {
        ObjectKind::Host => CheckState::Down,
        _ => CheckState::Unknown,
    }
}

fn map_exit_state(kind: ObjectKind, exit_status: i32) -> CheckState {
    match kind {
        ObjectKind::Host => CheckState::from_host_exit(exit_status),
        _ => CheckState::from_service_exit(exit_status),
    }
}

/// Builds a synthetic failure result outside the runner path (unknown check
/// command, scheduler-side faults).
pub fn synthetic_failure(
    key: &ObjectKey,
    scheduled_at: f64,
    check_source: &str,
    reason: &str,
) -> CheckResult {
    let now = now_ts();
    CheckResult {
        schedule_start: scheduled_at,
        schedule_end: now,
        execution_start: now,
        execution_end: now,
        exit_status: 3,
        output: reason.to_string(),
        long_output: String::new(),
        performance_data: String::new(),
        state: synthetic_state(key.kind),
        check_source: check_source.to_string(),
        vars_before: None,
        vars_after: None,
    }
}

/// Runs one check to completion, honoring the command deadline. Never fails:
/// timeouts and launch failures become synthetic results.
pub async fn execute_check(
    runner: &dyn CheckRunner,
    command: &CheckCommand,
    key: &ObjectKey,
    scheduled_at: f64,
    fallback_timeout: Duration,
    check_source: &str,
) -> CheckResult {
    let deadline = command.timeout.unwrap_or(fallback_timeout);
    let execution_start = now_ts();

    let outcome = tokio::time::timeout(deadline, runner.run(command)).await;
    let execution_end = now_ts();

    let (state, output, long_output, performance_data, exit_status) = match outcome {
        Ok(Ok(plugin)) => {
            let (output, long_output, perfdata) = parse_plugin_output(&plugin.stdout);
            (
                map_exit_state(key.kind, plugin.exit_status),
                output,
                long_output,
                perfdata,
                plugin.exit_status,
            )
        }
        Ok(Err(e)) => {
            debug!("Check '{}' for '{key}' failed to launch: {e}", command.name);
            (
                synthetic_state(key.kind),
                format!("Check command '{}' could not be executed: {e}", command.name),
                String::new(),
                String::new(),
                3,
            )
        }
        Err(_) => (
            synthetic_state(key.kind),
            format!(
                "Check command '{}' timed out after {:.1}s",
                command.name,
                deadline.as_secs_f64()
            ),
            String::new(),
            String::new(),
            3,
        ),
    };

    CheckResult {
        schedule_start: scheduled_at,
        schedule_end: execution_end,
        execution_start,
        execution_end,
        exit_status,
        output,
        long_output,
        performance_data,
        state,
        check_source: check_source.to_string(),
        vars_before: None,
        vars_after: None,
    }
}
