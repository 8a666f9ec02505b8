//! The recovery manager.
//!
//! [`RecoveryManager`] is shared by the agent's heartbeat loop and the threads
//! that finish command execution. It
//!
//! - tracks current/desired state and config staleness per component,
//! - stores the execution-command templates the controller ships inside
//!   status commands,
//! - decides which components need a corrective command, and
//! - throttles those commands per component with [`ActionCounter`]s that are
//!   persisted after every decision.
//!
//! Nothing here returns an error to the caller: recovery must never take the
//! agent down, so failures are logged and the operation degrades to a no-op.
//!
//! Locking: the component table (statuses and templates) sits behind one
//! mutex and every update is a full read-modify-write under it. Action
//! counters have their own mutex. The configuration is an immutable value
//! swapped behind a read/write lock.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::command::{
    CommandOutcome, CommandStore, CommandType, ExecutionCommand, PayloadLevel, RecoveryAction,
    RoleCommand, StatusCommand,
};
use crate::config::{ManagerOptions, RecoveryConfig, RecoveryPolicy, RegistrationRecoveryConfig};
use crate::counter::ActionCounter;
use crate::report::RecoveryReport;
use crate::state::{ComponentState, ComponentStatus};
use crate::store::{ActionMap, ActionStore};

/// Key of the recovery section in a registration response.
const RECOVERY_CONFIG_KEY: &str = "recoveryConfig";

/// Key stamped into synthesized commands when the template has none.
const CLUSTER_ID_KEY: &str = "clusterId";

#[derive(Debug, Default)]
struct ComponentTable {
    statuses: BTreeMap<String, ComponentStatus>,
    commands: CommandStore,
}

impl ComponentTable {
    fn set_current(&mut self, component: &str, state: ComponentState) {
        let is_new = !self.statuses.contains_key(component);
        if is_new {
            info!("New status, current status is set to {} for {}", state, component);
        }
        self.update(component, |status| {
            if !is_new && status.current != state {
                info!("current status is set to {} for {}", state, component);
            }
            status.current = state;
        });
    }

    /// Apply `update` to the status of `component`, creating it on first use,
    /// and drop the stored template once the component has settled.
    fn update<F>(&mut self, component: &str, update: F)
    where
        F: FnOnce(&mut ComponentStatus),
    {
        let status = self.statuses.entry(component.to_string()).or_default();
        update(status);
        if status.is_settled() {
            self.commands.remove(component);
        }
    }
}

/// Agent-side auto-recovery engine.
pub struct RecoveryManager {
    config: RwLock<Arc<RecoveryConfig>>,
    components: Mutex<ComponentTable>,
    actions: Mutex<ActionMap>,
    store: ActionStore,
    clock: Arc<dyn Clock>,
    paused: AtomicBool,
    active_commands: AtomicI64,
    next_task_id: AtomicU64,
    cluster_id: RwLock<Option<String>>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &*self.config.read())
            .field("actions_file", &self.store.path())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Create a manager using the system clock.
    #[must_use]
    pub fn new(options: &ManagerOptions) -> Self {
        Self::with_clock(options, Arc::new(SystemClock))
    }

    /// Create a manager driven by `clock`.
    #[must_use]
    pub fn with_clock(options: &ManagerOptions, clock: Arc<dyn Clock>) -> Self {
        let store = ActionStore::new(&options.cache_dir);

        let actions = if options.restore_counters {
            let actions = store.load_or_empty();
            info!(
                "Restored {} recovery action counters from {}",
                actions.len(),
                store.path().display()
            );
            actions
        } else {
            ActionMap::new()
        };

        let seed = u64::try_from(clock.now()).unwrap_or_default();

        let manager = Self {
            config: RwLock::new(Arc::new(RecoveryConfig::default())),
            components: Mutex::new(ComponentTable::default()),
            actions: Mutex::new(actions),
            store,
            clock,
            paused: AtomicBool::new(false),
            active_commands: AtomicI64::new(0),
            next_task_id: AtomicU64::new(seed),
            cluster_id: RwLock::new(None),
        };
        manager.update_config(options.initial_config());
        manager
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Arc<RecoveryConfig> {
        Arc::clone(&self.config.read())
    }

    #[must_use]
    pub fn enabled(&self) -> bool {
        self.config.read().recovery_enabled
    }

    /// Replace the configuration.
    ///
    /// An invalid configuration is not applied: recovery is switched off and
    /// every other setting keeps its previous value. Returns whether `config`
    /// was applied.
    pub fn update_config(&self, config: RecoveryConfig) -> bool {
        if let Err(e) = config.validate() {
            warn!("Recovery disabled: {}", e);
            let mut guard = self.config.write();
            let mut disabled = (**guard).clone();
            disabled.recovery_enabled = false;
            *guard = Arc::new(disabled);
            return false;
        }

        if config.recovery_enabled {
            info!(
                "==> Auto recovery is enabled with maximum {} in {} minutes with gap of {} minutes \
                 between and lifetime max being {}. Enabled components - {}, Disabled components - {}",
                config.max_count,
                config.window_in_min,
                config.retry_gap,
                config.max_lifetime_count,
                config.enabled_components.join(", "),
                config.disabled_components.join(", ")
            );
        }

        *self.config.write() = Arc::new(config);
        true
    }

    /// Apply the `recoveryConfig` section of a registration response. A
    /// missing section resets to the defaults with recovery off.
    pub fn update_configuration_from_registration(&self, registration: Option<&Value>) {
        self.apply_recovery_section(registration.and_then(|r| r.get(RECOVERY_CONFIG_KEY)));
    }

    pub(crate) fn apply_recovery_section(&self, section: Option<&Value>) {
        let parsed = match section {
            Some(value) => {
                info!("RecoverConfig = {}", value);
                RegistrationRecoveryConfig::from_value(value)
            }
            None => RegistrationRecoveryConfig::default(),
        };
        self.update_config(parsed.into_config());
    }

    #[must_use]
    pub fn configured_for_recovery(&self, component: &str) -> bool {
        self.config.read().configured_for_recovery(component)
    }

    // Status tracking

    #[must_use]
    pub fn get_current_status(&self, component: &str) -> Option<ComponentState> {
        self.components
            .lock()
            .statuses
            .get(component)
            .map(|s| s.current.clone())
    }

    #[must_use]
    pub fn get_desired_status(&self, component: &str) -> Option<ComponentState> {
        self.components
            .lock()
            .statuses
            .get(component)
            .map(|s| s.desired.clone())
    }

    #[must_use]
    pub fn get_status(&self, component: &str) -> Option<ComponentStatus> {
        self.components.lock().statuses.get(component).cloned()
    }

    /// Names of every tracked component.
    #[must_use]
    pub fn components(&self) -> Vec<String> {
        self.components.lock().statuses.keys().cloned().collect()
    }

    pub fn update_current_status(&self, component: &str, state: impl Into<ComponentState>) {
        self.components.lock().set_current(component, state.into());
    }

    pub fn update_desired_status(&self, component: &str, state: impl Into<ComponentState>) {
        let state = state.into();
        let mut table = self.components.lock();
        let is_new = !table.statuses.contains_key(component);
        if is_new {
            info!("New status, desired status is set to {} for {}", state, component);
        }
        table.update(component, |status| {
            if !is_new && status.desired != state {
                info!("desired status is set to {} for {}", state, component);
            }
            status.desired = state;
        });
    }

    pub fn update_config_staleness(&self, component: &str, is_config_stale: bool) {
        self.components.lock().update(component, |status| {
            status.stale_config = is_config_stale;
        });
    }

    /// Apply a live status report from a local status check.
    ///
    /// A failed install sticks until a command succeeds; only a STARTED
    /// report overrides it.
    pub fn handle_status_change(&self, component: &str, state: impl Into<ComponentState>) {
        if !self.enabled() || !self.configured_for_recovery(component) {
            return;
        }

        let state = state.into();
        let mut table = self.components.lock();
        let install_failed = table
            .statuses
            .get(component)
            .is_some_and(|s| s.current == ComponentState::InstallFailed);
        if state != ComponentState::Started && install_failed {
            debug!("Keeping INSTALL_FAILED for {} over reported {}", component, state);
            return;
        }
        table.set_current(component, state);
    }

    // Controller commands

    /// Ingest STATUS commands: desired state, config staleness and, at the
    /// `EXECUTION_COMMAND` payload level, the execution template.
    pub fn process_status_commands(&self, commands: &[StatusCommand]) {
        if !self.enabled() {
            return;
        }
        for command in commands {
            self.store_or_update_command(command);
            if let Some(details) = &command.execution_command_details {
                debug!(
                    component = %command.component_name,
                    "Details to construct exec commands: {}",
                    details
                );
            }
        }
    }

    /// Infer desired states from controller-issued EXECUTION commands.
    pub fn process_execution_commands(&self, commands: &[ExecutionCommand]) {
        if !self.enabled() {
            return;
        }
        for command in commands {
            if command.command_type != CommandType::Execution
                || !self.configured_for_recovery(&command.role)
            {
                continue;
            }

            let desired = match command.role_command {
                RoleCommand::Install | RoleCommand::Stop => ComponentState::Installed,
                RoleCommand::Start => ComponentState::Started,
                RoleCommand::CustomCommand if command.is_restart() => ComponentState::Started,
                _ => continue,
            };
            info!(
                "Received EXECUTION_COMMAND ({}), desired state of {} to {}",
                command.role_command, command.role, desired
            );
            self.update_desired_status(&command.role, desired);
        }
    }

    /// Update the current state of a component after one of its commands
    /// finished.
    pub fn process_execution_command_result(
        &self,
        command: &ExecutionCommand,
        outcome: CommandOutcome,
    ) {
        if !self.enabled() || !self.configured_for_recovery(&command.role) {
            return;
        }

        let current = match (outcome, &command.role_command) {
            (CommandOutcome::Completed, RoleCommand::Start) => ComponentState::Started,
            (CommandOutcome::Completed, RoleCommand::Stop | RoleCommand::Install) => {
                ComponentState::Installed
            }
            (CommandOutcome::Completed, RoleCommand::CustomCommand) if command.is_restart() => {
                ComponentState::Started
            }
            (CommandOutcome::Failed, RoleCommand::Install) => ComponentState::InstallFailed,
            _ => return,
        };
        info!(
            task_id = ?command.task_id,
            "After EXECUTION_COMMAND ({}), current state of {} to {}",
            command.role_command, command.role, current
        );
        self.update_current_status(&command.role, current);
    }

    /// Store the template and desired state carried by a STATUS command.
    pub fn store_or_update_command(&self, command: &StatusCommand) {
        if !self.enabled() {
            return;
        }
        if command.command_type != CommandType::Status {
            debug!("Ignoring {} in status command list", command.command_type.as_str());
            return;
        }

        let component = &command.component_name;
        self.update_desired_status(component, command.desired_state.clone());
        self.update_config_staleness(component, command.has_stale_configs);

        if command.payload_level == PayloadLevel::ExecutionCommand {
            match command.execution_template() {
                Some(Ok(details)) => {
                    let now = self.clock.now();
                    let mut table = self.components.lock();
                    table.commands.remove(component);
                    table.commands.insert(component, details, now);
                    debug!("Stored command details for {}", component);
                }
                Some(Err(e)) => warn!("Not storing execution command template: {}", e),
                None => warn!("Expected field executionCommandDetails unavailable."),
            }
        }
    }

    /// Whether a fresh template is stored for `component`. Stale templates are
    /// dropped by this check.
    #[must_use]
    pub fn command_exists(&self, component: &str) -> bool {
        let now = self.clock.now();
        self.components.lock().commands.fresh(component, now).is_some()
    }

    pub fn remove_command(&self, component: &str) -> bool {
        self.components.lock().commands.remove(component)
    }

    // Decisions

    /// Whether `component` is in a state recovery should fix.
    #[must_use]
    pub fn requires_recovery(&self, component: &str) -> bool {
        let config = self.config();
        if !config.recovery_enabled || !config.configured_for_recovery(component) {
            return false;
        }
        let Some(status) = self.get_status(component) else {
            return false;
        };

        if !is_recoverable(&status, config.policy) {
            return false;
        }
        info!(
            "{} needs recovery, desired = {}, and current = {}.",
            component, status.desired, status.current
        );
        true
    }

    /// Check the rate limiter for `action` without recording an attempt.
    #[must_use]
    pub fn may_execute(&self, action: &str) -> bool {
        if action.trim().is_empty() {
            return false;
        }
        let config = self.config();
        let now = self.clock.now();
        let mut actions = self.actions.lock();
        actions
            .entry(action.to_string())
            .or_default()
            .may_attempt(now, &config)
    }

    /// Record an attempt for `action` if the rate limiter allows it, then
    /// persist all counters.
    pub fn execute(&self, action: &str) -> bool {
        if action.trim().is_empty() {
            return false;
        }
        let config = self.config();
        let now = self.clock.now();
        let mut actions = self.actions.lock();
        let executed = actions
            .entry(action.to_string())
            .or_default()
            .try_attempt(action, now, &config);

        if let Err(e) = self.store.dump(&actions) {
            error!(
                "Unable to dump actions to {}: {}",
                self.store.path().display(),
                e
            );
        }
        executed
    }

    /// Snapshot of all action counters.
    #[must_use]
    pub fn get_actions_copy(&self) -> ActionMap {
        self.actions.lock().clone()
    }

    #[must_use]
    pub fn get_action(&self, action: &str) -> Option<ActionCounter> {
        self.actions.lock().get(action).cloned()
    }

    /// True when the last attempt for `action` is older than one window.
    #[must_use]
    pub fn is_action_info_stale(&self, action: &str) -> bool {
        let config = self.config();
        let now = self.clock.now();
        self.actions
            .lock()
            .get(action)
            .is_some_and(|counter| counter.is_stale(now, &config))
    }

    #[must_use]
    pub fn get_recovery_status(&self) -> RecoveryReport {
        let config = self.config();
        let actions = self.actions.lock();
        RecoveryReport::from_actions(&actions, &config)
    }

    /// Compute the recovery commands for this cycle, committing a rate-limited
    /// attempt for each one returned.
    pub fn get_recovery_commands(&self) -> Vec<ExecutionCommand> {
        let mut commands = Vec::new();
        for component in self.components() {
            if !self.requires_recovery(&component) || !self.may_execute(&component) {
                continue;
            }
            let Some(status) = self.get_status(&component) else {
                continue;
            };
            let policy = self.config().policy;
            let Some(action) = select_action(&status, policy) else {
                continue;
            };
            let Some(template) = self.recovery_template(&component, action) else {
                continue;
            };
            if !self.execute(&component) {
                continue;
            }

            let command = self.synthesize(&template, action);
            info!(
                "Created recovery command {} for component {}",
                command.role_command, command.role
            );
            commands.push(command);
        }
        commands
    }

    // Command synthesis

    #[must_use]
    pub fn get_install_command(&self, component: &str) -> Option<ExecutionCommand> {
        self.recovery_command(component, RecoveryAction::Install)
    }

    #[must_use]
    pub fn get_start_command(&self, component: &str) -> Option<ExecutionCommand> {
        self.recovery_command(component, RecoveryAction::Start)
    }

    #[must_use]
    pub fn get_stop_command(&self, component: &str) -> Option<ExecutionCommand> {
        self.recovery_command(component, RecoveryAction::Stop)
    }

    #[must_use]
    pub fn get_restart_command(&self, component: &str) -> Option<ExecutionCommand> {
        self.recovery_command(component, RecoveryAction::Restart)
    }

    fn recovery_command(&self, component: &str, action: RecoveryAction) -> Option<ExecutionCommand> {
        self.recovery_template(component, action)
            .map(|template| self.synthesize(&template, action))
    }

    /// The fresh template `action` would be built from, unless recovery is
    /// paused or off.
    fn recovery_template(&self, component: &str, action: RecoveryAction) -> Option<ExecutionCommand> {
        if self.is_paused() {
            info!("Recovery is paused, likely tasks waiting in pipeline for this host.");
            return None;
        }
        if !self.enabled() {
            info!("Recovery is not enabled. {} command will not be computed.", action);
            return None;
        }

        debug!("Using stored {} command for {}", action, component);
        let now = self.clock.now();
        let template = self.components.lock().commands.fresh(component, now).cloned();
        if template.is_none() {
            info!(
                "{} command cannot be computed as details are not received from Server.",
                action
            );
        }
        template
    }

    fn synthesize(&self, template: &ExecutionCommand, action: RecoveryAction) -> ExecutionCommand {
        let mut command = template.synthesize(action, self.get_unique_task_id());
        if let Some(cluster_id) = self.cluster_id.read().as_ref() {
            command
                .payload
                .entry(CLUSTER_ID_KEY)
                .or_insert_with(|| Value::String(cluster_id.clone()));
        }
        command
    }

    /// Next task id for a synthesized command.
    pub fn get_unique_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn set_cluster_id(&self, cluster_id: Option<String>) {
        *self.cluster_id.write() = cluster_id;
    }

    // Coordination with the agent runtime

    /// Stand recovery down while controller-issued work is queued.
    pub fn set_paused(&self, paused: bool) {
        if self.paused.swap(paused, Ordering::SeqCst) != paused {
            debug!(paused, "Recovery pause flag changed");
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn start_execution_command(&self) {
        self.active_commands.fetch_add(1, Ordering::SeqCst);
    }

    pub fn stop_execution_command(&self) {
        self.active_commands.fetch_sub(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn has_active_command(&self) -> bool {
        self.active_commands.load(Ordering::SeqCst) > 0
    }

    /// Location of the persisted counters.
    #[must_use]
    pub fn actions_file(&self) -> &std::path::Path {
        self.store.path()
    }
}

/// Whether the gap between current and desired state is one `policy` acts on.
fn is_recoverable(status: &ComponentStatus, policy: RecoveryPolicy) -> bool {
    match policy {
        RecoveryPolicy::AutoStartOnly | RecoveryPolicy::AutoInstallStart => {
            if status.current == status.desired {
                return false;
            }
        }
        RecoveryPolicy::Full => {
            if status.is_settled() {
                return false;
            }
        }
    }

    policy.allowed_desired_states().contains(&status.desired)
        && policy.allowed_current_states().contains(&status.current)
}

/// The corrective action for a component's state under `policy`.
fn select_action(status: &ComponentStatus, policy: RecoveryPolicy) -> Option<RecoveryAction> {
    use ComponentState::{InstallFailed, Installed, Init, Started};

    match policy {
        RecoveryPolicy::AutoStartOnly => match (&status.desired, &status.current) {
            (Started, Installed) => Some(RecoveryAction::Start),
            _ => None,
        },
        RecoveryPolicy::AutoInstallStart => match (&status.desired, &status.current) {
            (Started, Installed) => Some(RecoveryAction::Start),
            (Started | Installed, InstallFailed) => Some(RecoveryAction::Install),
            _ => None,
        },
        RecoveryPolicy::Full if status.desired != status.current => {
            match (&status.desired, &status.current) {
                (Started, Installed) => Some(RecoveryAction::Start),
                (Started | Installed, Init | InstallFailed) => Some(RecoveryAction::Install),
                (Installed, Started) => Some(RecoveryAction::Stop),
                _ => None,
            }
        }
        RecoveryPolicy::Full => match &status.current {
            Installed => Some(RecoveryAction::Install),
            Started => Some(RecoveryAction::Restart),
            _ => None,
        },
    }
}
