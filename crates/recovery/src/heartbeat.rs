//! Controller responses as seen by the agent's heartbeat loop.
//!
//! Commands are kept as raw JSON until they are applied so that one malformed
//! entry does not throw away the rest of the response.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::command::{ExecutionCommand, StatusCommand};
use crate::error::{RecoveryError, RecoveryResult};
use crate::manager::RecoveryManager;

/// Heartbeat response from the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatResponse {
    #[serde(default)]
    pub status_commands: Vec<Value>,
    #[serde(default)]
    pub execution_commands: Vec<Value>,
    /// Controller-issued work is still queued for this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_pending_tasks: Option<bool>,
}

impl HeartbeatResponse {
    pub fn parse(raw: &str) -> RecoveryResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Well-formed status commands; the rest are logged and skipped.
    #[must_use]
    pub fn status_commands(&self) -> Vec<StatusCommand> {
        parse_all("status", &self.status_commands)
    }

    /// Well-formed execution commands; the rest are logged and skipped.
    #[must_use]
    pub fn execution_commands(&self) -> Vec<ExecutionCommand> {
        parse_all("execution", &self.execution_commands)
    }
}

/// Registration response from the controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_config: Option<Value>,
}

impl RegistrationResponse {
    pub fn parse(raw: &str) -> RecoveryResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// What a heartbeat contributed to the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppliedHeartbeat {
    pub status_commands: usize,
    pub execution_commands: usize,
    pub skipped: usize,
}

/// Feed a heartbeat response into `manager`.
pub fn apply_heartbeat(manager: &RecoveryManager, response: &HeartbeatResponse) -> AppliedHeartbeat {
    if let Some(pending) = response.has_pending_tasks {
        manager.set_paused(pending);
    }

    let status_commands = response.status_commands();
    let execution_commands = response.execution_commands();
    manager.process_status_commands(&status_commands);
    manager.process_execution_commands(&execution_commands);

    let received = response.status_commands.len() + response.execution_commands.len();
    let applied = AppliedHeartbeat {
        status_commands: status_commands.len(),
        execution_commands: execution_commands.len(),
        skipped: received - status_commands.len() - execution_commands.len(),
    };
    debug!(
        status = applied.status_commands,
        execution = applied.execution_commands,
        skipped = applied.skipped,
        "Applied heartbeat response"
    );
    applied
}

/// Apply the recovery section of a registration response.
pub fn apply_registration(manager: &RecoveryManager, response: &RegistrationResponse) {
    manager.apply_recovery_section(response.recovery_config.as_ref());
}

fn parse_all<T: DeserializeOwned>(kind: &str, values: &[Value]) -> Vec<T> {
    values
        .iter()
        .filter_map(|value| match parse_command(kind, value) {
            Ok(command) => Some(command),
            Err(e) => {
                debug!("Skipping command: {}", e);
                None
            }
        })
        .collect()
}

fn parse_command<T: DeserializeOwned>(kind: &str, value: &Value) -> RecoveryResult<T> {
    T::deserialize(value).map_err(|e| RecoveryError::MalformedCommand(format!("{kind} command: {e}")))
}
