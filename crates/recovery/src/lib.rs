//! Agent-side auto-recovery for cluster host components.
//!
//! The controller tells every agent what state each of its components should
//! be in. This crate tracks where each component actually is, decides when a
//! component has drifted far enough to need a corrective command, and
//! synthesizes that command from a template the controller shipped earlier.
//!
//! ## Throttling
//!
//! Every corrective action goes through a per-component rate limiter:
//!
//! - at most `max_count` attempts per `window_in_min` minute window,
//! - at least `retry_gap` minutes between attempts,
//! - at most `max_lifetime_count` attempts for the life of the agent.
//!
//! Counters are persisted to `<cache_dir>/recovery.json` after every decision.
//!
//! ## Example
//!
//! ```rust,ignore
//! use recovery::{ManagerOptions, RecoveryManager};
//!
//! let manager = RecoveryManager::new(&ManagerOptions::from_env());
//! manager.update_configuration_from_registration(Some(&registration));
//! recovery::apply_heartbeat(&manager, &heartbeat);
//!
//! for command in manager.get_recovery_commands() {
//!     runtime.enqueue(command.to_value());
//! }
//! ```

pub mod clock;
pub mod command;
pub mod config;
pub mod counter;
pub mod error;
pub mod heartbeat;
pub mod manager;
pub mod report;
pub mod state;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use command::{
    CommandOutcome, CommandType, ExecutionCommand, PayloadLevel, RecoveryAction, RoleCommand,
    StatusCommand,
};
pub use config::{ManagerOptions, RecoveryConfig, RecoveryPolicy, RegistrationRecoveryConfig};
pub use counter::{ActionCounter, GateState};
pub use error::{ConfigError, RecoveryError, RecoveryResult};
pub use heartbeat::{
    apply_heartbeat, apply_registration, AppliedHeartbeat, HeartbeatResponse, RegistrationResponse,
};
pub use manager::RecoveryManager;
pub use report::{ComponentReport, RecoveryReport, RecoverySummary};
pub use state::{ComponentState, ComponentStatus};
pub use store::{ActionMap, ActionStore};
