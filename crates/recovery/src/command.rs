//! Typed controller commands and the stored execution-command templates.
//!
//! Commands arrive from the controller as JSON. Field names are the wire
//! contract and are kept verbatim via serde renames. Everything in an
//! execution command that recovery does not interpret is carried in a
//! flattened map so a synthesized command is a faithful copy of its template.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::error::{RecoveryError, RecoveryResult};
use crate::state::ComponentState;

/// Stored templates older than this many seconds are discarded.
pub const COMMAND_REFRESH_DELAY_SEC: i64 = 600;

/// Host-level parameter naming the custom command to run.
pub const CUSTOM_COMMAND_KEY: &str = "custom_command";

/// Custom command used for recovery restarts.
pub const CUSTOM_COMMAND_RESTART: &str = "RESTART";

/// Kind of command envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum CommandType {
    Status,
    Execution,
    /// Synthesized by the agent itself rather than issued by the controller.
    AutoExecution,
    Other(String),
}

impl CommandType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Status => "STATUS_COMMAND",
            Self::Execution => "EXECUTION_COMMAND",
            Self::AutoExecution => "AUTO_EXECUTION_COMMAND",
            Self::Other(s) => s,
        }
    }

    fn status() -> Self {
        Self::Status
    }

    fn execution() -> Self {
        Self::Execution
    }
}

impl From<String> for CommandType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "STATUS_COMMAND" => Self::Status,
            "EXECUTION_COMMAND" => Self::Execution,
            "AUTO_EXECUTION_COMMAND" => Self::AutoExecution,
            _ => Self::Other(value),
        }
    }
}

impl From<CommandType> for String {
    fn from(value: CommandType) -> Self {
        value.as_str().to_string()
    }
}

/// Operation an execution command performs on its role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RoleCommand {
    Install,
    Start,
    Stop,
    CustomCommand,
    Other(String),
}

impl RoleCommand {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Install => "INSTALL",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::CustomCommand => "CUSTOM_COMMAND",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for RoleCommand {
    fn from(value: String) -> Self {
        match value.as_str() {
            "INSTALL" => Self::Install,
            "START" => Self::Start,
            "STOP" => Self::Stop,
            "CUSTOM_COMMAND" => Self::CustomCommand,
            _ => Self::Other(value),
        }
    }
}

impl From<RoleCommand> for String {
    fn from(value: RoleCommand) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for RoleCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How much detail a status command carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadLevel {
    Minimal,
    /// The command includes `executionCommandDetails`.
    ExecutionCommand,
    #[default]
    #[serde(other)]
    Default,
}

/// Result of a finished execution command as reported by the agent runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandOutcome {
    Completed,
    Failed,
    #[serde(other)]
    InProgress,
}

/// Periodic status check for one component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusCommand {
    #[serde(default = "CommandType::status")]
    pub command_type: CommandType,
    pub component_name: String,
    #[serde(default)]
    pub desired_state: ComponentState,
    #[serde(default)]
    pub has_stale_configs: bool,
    #[serde(default)]
    pub payload_level: PayloadLevel,
    /// Raw execution template, interpreted only when it is stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_command_details: Option<Value>,
}

impl StatusCommand {
    /// Parse the attached execution template, if any.
    pub fn execution_template(&self) -> Option<RecoveryResult<ExecutionCommand>> {
        self.execution_command_details.as_ref().map(|details| {
            ExecutionCommand::deserialize(details).map_err(|e| {
                RecoveryError::MalformedCommand(format!(
                    "executionCommandDetails of {}: {e}",
                    self.component_name
                ))
            })
        })
    }
}

/// Command that changes a component's lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionCommand {
    #[serde(default = "CommandType::execution")]
    pub command_type: CommandType,
    pub role: String,
    pub role_command: RoleCommand,
    /// Replaced on synthesis, so a malformed value is dropped.
    #[serde(
        default,
        deserialize_with = "lenient_task_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub task_id: Option<u64>,
    #[serde(default)]
    pub host_level_params: Map<String, Value>,
    /// Every other field of the payload, untouched.
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl ExecutionCommand {
    /// The custom command name, from `hostLevelParams` or the top level.
    #[must_use]
    pub fn custom_command(&self) -> Option<&str> {
        self.host_level_params
            .get(CUSTOM_COMMAND_KEY)
            .or_else(|| self.payload.get(CUSTOM_COMMAND_KEY))
            .and_then(Value::as_str)
    }

    #[must_use]
    pub fn is_restart(&self) -> bool {
        self.role_command == RoleCommand::CustomCommand
            && self.custom_command() == Some(CUSTOM_COMMAND_RESTART)
    }

    /// Deep copy of this template turned into an agent-issued command.
    #[must_use]
    pub fn synthesize(&self, action: RecoveryAction, task_id: u64) -> Self {
        let mut command = self.clone();
        command.command_type = CommandType::AutoExecution;
        command.role_command = action.role_command();
        command.task_id = Some(task_id);
        if action == RecoveryAction::Restart {
            command.host_level_params.insert(
                CUSTOM_COMMAND_KEY.to_string(),
                Value::String(CUSTOM_COMMAND_RESTART.to_string()),
            );
        }
        command
    }

    /// Generic JSON form for handing the command back to the agent runtime.
    #[must_use]
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

fn lenient_task_id<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64(),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

/// Corrective action recovery may take for a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecoveryAction {
    Install,
    Start,
    Stop,
    Restart,
}

impl RecoveryAction {
    #[must_use]
    pub fn role_command(self) -> RoleCommand {
        match self {
            Self::Install => RoleCommand::Install,
            Self::Start => RoleCommand::Start,
            Self::Stop => RoleCommand::Stop,
            Self::Restart => RoleCommand::CustomCommand,
        }
    }
}

impl fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Install => "INSTALL",
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Restart => "RESTART",
        };
        f.write_str(name)
    }
}

/// A stored template and when it was stored (epoch seconds).
#[derive(Debug, Clone, PartialEq)]
pub struct StoredCommand {
    pub command: ExecutionCommand,
    pub stored_at: i64,
}

/// Execution-command templates keyed by component name.
#[derive(Debug, Default)]
pub struct CommandStore {
    commands: HashMap<String, StoredCommand>,
}

impl CommandStore {
    /// Store (replacing) the template for `component`.
    pub fn insert(&mut self, component: &str, command: ExecutionCommand, now: i64) {
        self.commands.insert(
            component.to_string(),
            StoredCommand {
                command,
                stored_at: now,
            },
        );
        debug!("Added command for component : {}", component);
    }

    /// Returns whether a template was removed.
    pub fn remove(&mut self, component: &str) -> bool {
        let removed = self.commands.remove(component).is_some();
        if removed {
            debug!("Removed stored command for component : {}", component);
        }
        removed
    }

    /// The template for `component` if one exists and is fresh. A stale
    /// template is dropped.
    pub fn fresh(&mut self, component: &str, now: i64) -> Option<&ExecutionCommand> {
        let age = now - self.commands.get(component)?.stored_at;
        if age > COMMAND_REFRESH_DELAY_SEC {
            debug!(
                "Removing stored command for component : {} as its {} sec old",
                component, age
            );
            self.remove(component);
            return None;
        }
        self.commands.get(component).map(|stored| &stored.command)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}
