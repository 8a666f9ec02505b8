//! Recovery configuration.
//!
//! [`RecoveryConfig`] is an immutable value. The manager swaps it wholesale on
//! every update so readers never observe a half-applied configuration.
//!
//! Configuration reaches the agent two ways:
//!
//! - the `recoveryConfig` object of the controller's registration response,
//!   parsed by [`RegistrationRecoveryConfig`], and
//! - process options from environment variables, read by
//!   [`ManagerOptions::from_env`].

use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::ConfigError;
use crate::state::ComponentState;

/// Default attempts allowed per window.
pub const DEFAULT_MAX_COUNT: i64 = 6;
/// Default window length in minutes.
pub const DEFAULT_WINDOW_IN_MIN: i64 = 60;
/// Default minimum gap between attempts in minutes.
pub const DEFAULT_RETRY_GAP: i64 = 5;
/// Default attempts allowed over the agent's lifetime.
pub const DEFAULT_MAX_LIFETIME_COUNT: i64 = 12;

/// Environment variable overriding the cache directory.
const ENV_CACHE_DIR: &str = "RECOVERY_CACHE_DIR";
/// Environment variable enabling counter restore at startup.
const ENV_RESTORE_COUNTERS: &str = "RECOVERY_RESTORE_COUNTERS";
/// Environment variable enabling recovery before registration.
const ENV_ENABLED: &str = "RECOVERY_ENABLED";
/// Environment variable selecting auto-start-only recovery.
const ENV_AUTO_START_ONLY: &str = "RECOVERY_AUTO_START_ONLY";

/// Which transitions recovery may drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoveryPolicy {
    /// INSTALL, START, STOP and RESTART as needed.
    #[default]
    Full,
    /// Only INSTALLED -> STARTED.
    AutoStartOnly,
    /// START for installed components, re-INSTALL after a failed install.
    AutoInstallStart,
}

impl RecoveryPolicy {
    /// Desired states recovery will act towards.
    #[must_use]
    pub fn allowed_desired_states(self) -> &'static [ComponentState] {
        match self {
            Self::Full | Self::AutoInstallStart => {
                &[ComponentState::Started, ComponentState::Installed]
            }
            Self::AutoStartOnly => &[ComponentState::Started],
        }
    }

    /// Current states recovery will act from.
    #[must_use]
    pub fn allowed_current_states(self) -> &'static [ComponentState] {
        match self {
            Self::Full => &[
                ComponentState::Init,
                ComponentState::InstallFailed,
                ComponentState::Installed,
                ComponentState::Started,
            ],
            Self::AutoStartOnly => &[ComponentState::Installed],
            Self::AutoInstallStart => &[ComponentState::InstallFailed, ComponentState::Installed],
        }
    }
}

/// Recovery type announced by the controller at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RecoveryType {
    /// Recovery off.
    #[default]
    Default,
    AutoStart,
    AutoInstallStart,
    Full,
}

impl RecoveryType {
    /// Parse the registration `type` field; unknown values disable recovery.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "AUTO_START" => Self::AutoStart,
            "AUTO_INSTALL_START" => Self::AutoInstallStart,
            "FULL" => Self::Full,
            _ => Self::Default,
        }
    }

    #[must_use]
    pub fn enabled(self) -> bool {
        !matches!(self, Self::Default)
    }

    #[must_use]
    pub fn policy(self) -> RecoveryPolicy {
        match self {
            Self::AutoStart => RecoveryPolicy::AutoStartOnly,
            Self::AutoInstallStart => RecoveryPolicy::AutoInstallStart,
            Self::Default | Self::Full => RecoveryPolicy::Full,
        }
    }
}

/// Process-wide recovery configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Attempts allowed per window.
    pub max_count: i64,
    /// Window length in minutes.
    pub window_in_min: i64,
    /// Minimum spacing between attempts in minutes.
    pub retry_gap: i64,
    /// Attempts allowed over the agent's lifetime.
    pub max_lifetime_count: i64,
    pub recovery_enabled: bool,
    pub policy: RecoveryPolicy,
    /// Allow-list. When non-empty only these components are recovered.
    pub enabled_components: Vec<String>,
    /// Deny-list. Consulted only when the allow-list is empty.
    pub disabled_components: Vec<String>,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_count: DEFAULT_MAX_COUNT,
            window_in_min: DEFAULT_WINDOW_IN_MIN,
            retry_gap: DEFAULT_RETRY_GAP,
            max_lifetime_count: DEFAULT_MAX_LIFETIME_COUNT,
            recovery_enabled: false,
            policy: RecoveryPolicy::Full,
            enabled_components: Vec::new(),
            disabled_components: Vec::new(),
        }
    }
}

impl RecoveryConfig {
    /// Build a configuration with the given thresholds and recovery switched on.
    #[must_use]
    pub fn enabled(max_count: i64, window_in_min: i64, retry_gap: i64, max_lifetime_count: i64) -> Self {
        Self {
            max_count,
            window_in_min,
            retry_gap,
            max_lifetime_count,
            recovery_enabled: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_policy(mut self, policy: RecoveryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the allow-list from a comma separated string.
    #[must_use]
    pub fn with_enabled_components(mut self, csv: &str) -> Self {
        self.enabled_components = parse_component_list(csv);
        self
    }

    /// Set the deny-list from a comma separated string.
    #[must_use]
    pub fn with_disabled_components(mut self, csv: &str) -> Self {
        self.disabled_components = parse_component_list(csv);
        self
    }

    #[must_use]
    pub fn window_in_sec(&self) -> i64 {
        self.window_in_min.saturating_mul(60)
    }

    #[must_use]
    pub fn retry_gap_in_sec(&self) -> i64 {
        self.retry_gap.saturating_mul(60)
    }

    #[must_use]
    pub fn auto_start_only(&self) -> bool {
        self.policy == RecoveryPolicy::AutoStartOnly
    }

    #[must_use]
    pub fn auto_install_start(&self) -> bool {
        self.policy == RecoveryPolicy::AutoInstallStart
    }

    /// Check the thresholds. The first violated constraint is reported.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_count <= 0 {
            return Err(ConfigError::MaxCount(self.max_count));
        }
        if self.window_in_min <= 0 {
            return Err(ConfigError::Window(self.window_in_min));
        }
        if self.retry_gap < 1 {
            return Err(ConfigError::RetryGap(self.retry_gap));
        }
        if self.retry_gap >= self.window_in_min {
            return Err(ConfigError::RetryGapExceedsWindow {
                retry_gap: self.retry_gap,
                window_in_min: self.window_in_min,
            });
        }
        if self.max_lifetime_count < 0 || self.max_lifetime_count < self.max_count {
            return Err(ConfigError::LifetimeCount {
                max_lifetime_count: self.max_lifetime_count,
                max_count: self.max_count,
            });
        }
        Ok(())
    }

    /// Whether the allow/deny lists cover `component`.
    ///
    /// A non-empty allow-list takes exclusive precedence; otherwise anything
    /// not on the deny-list is covered.
    #[must_use]
    pub fn configured_for_recovery(&self, component: &str) -> bool {
        if !self.enabled_components.is_empty() {
            return self.enabled_components.iter().any(|c| c == component);
        }
        !self.disabled_components.iter().any(|c| c == component)
    }
}

/// Split a comma separated component list, trimming whitespace and dropping
/// empty entries.
#[must_use]
pub fn parse_component_list(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// The `recoveryConfig` object of a registration response.
///
/// Every field is optional and leniently typed: numbers may arrive as JSON
/// numbers or numeric strings, anything unparseable falls back to the default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRecoveryConfig {
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub recovery_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub window_in_minutes: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub retry_gap: Option<i64>,
    #[serde(default, deserialize_with = "lenient_int")]
    pub max_lifetime_count: Option<i64>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub enabled_components: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub disabled_components: Option<String>,
    /// Older controllers send the allow-list under this key.
    #[serde(default, deserialize_with = "lenient_string")]
    pub components: Option<String>,
}

impl RegistrationRecoveryConfig {
    /// Parse from a raw JSON value. A value that is not an object yields the
    /// all-defaults configuration.
    #[must_use]
    pub fn from_value(value: &Value) -> Self {
        match Self::deserialize(value) {
            Ok(config) => config,
            Err(e) => {
                debug!("Ignoring unparseable recoveryConfig: {}", e);
                Self::default()
            }
        }
    }

    /// Resolve into a full configuration, filling gaps with defaults.
    #[must_use]
    pub fn into_config(self) -> RecoveryConfig {
        let recovery_type = self
            .recovery_type
            .as_deref()
            .map(RecoveryType::parse)
            .unwrap_or_default();

        let enabled = self
            .enabled_components
            .or(self.components)
            .unwrap_or_default();
        let disabled = self.disabled_components.unwrap_or_default();

        RecoveryConfig {
            max_count: self.max_count.unwrap_or(DEFAULT_MAX_COUNT),
            window_in_min: self.window_in_minutes.unwrap_or(DEFAULT_WINDOW_IN_MIN),
            retry_gap: self.retry_gap.unwrap_or(DEFAULT_RETRY_GAP),
            max_lifetime_count: self
                .max_lifetime_count
                .unwrap_or(DEFAULT_MAX_LIFETIME_COUNT),
            recovery_enabled: recovery_type.enabled(),
            policy: recovery_type.policy(),
            enabled_components: parse_component_list(&enabled),
            disabled_components: parse_component_list(&disabled),
        }
    }
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    })
}

fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::String(s) => Some(s),
        _ => None,
    })
}

/// Process-level options for constructing a [`RecoveryManager`](crate::RecoveryManager).
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Directory holding `recovery.json`.
    pub cache_dir: PathBuf,
    /// Load persisted counters at startup. Off by default: counters start
    /// empty on every agent start.
    pub restore_counters: bool,
    /// Recovery state before the controller sends a configuration.
    pub recovery_enabled: bool,
    pub auto_start_only: bool,
}

impl ManagerOptions {
    #[must_use]
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            restore_counters: false,
            recovery_enabled: false,
            auto_start_only: false,
        }
    }

    #[must_use]
    pub fn recovery_enabled(mut self, enabled: bool) -> Self {
        self.recovery_enabled = enabled;
        self
    }

    #[must_use]
    pub fn auto_start_only(mut self, auto_start_only: bool) -> Self {
        self.auto_start_only = auto_start_only;
        self
    }

    #[must_use]
    pub fn restore_counters(mut self, restore: bool) -> Self {
        self.restore_counters = restore;
        self
    }

    /// Read options from environment variables, defaulting the cache
    /// directory to `/var/lib/ambari-agent/cache`.
    #[must_use]
    pub fn from_env() -> Self {
        let cache_dir = std::env::var(ENV_CACHE_DIR)
            .map_or_else(|_| PathBuf::from("/var/lib/ambari-agent/cache"), PathBuf::from);

        Self {
            cache_dir,
            restore_counters: env_flag(ENV_RESTORE_COUNTERS),
            recovery_enabled: env_flag(ENV_ENABLED),
            auto_start_only: env_flag(ENV_AUTO_START_ONLY),
        }
    }

    /// The configuration a fresh manager starts with.
    #[must_use]
    pub fn initial_config(&self) -> RecoveryConfig {
        RecoveryConfig {
            recovery_enabled: self.recovery_enabled,
            policy: if self.auto_start_only {
                RecoveryPolicy::AutoStartOnly
            } else {
                RecoveryPolicy::Full
            },
            ..RecoveryConfig::default()
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_config_is_valid_and_disabled() {
        let config = RecoveryConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.recovery_enabled);
        assert_eq!(config.window_in_sec(), 3600);
        assert_eq!(config.retry_gap_in_sec(), 300);
    }

    #[test]
    fn test_validation_constraints() {
        assert_eq!(
            RecoveryConfig::enabled(0, 60, 5, 12).validate(),
            Err(ConfigError::MaxCount(0))
        );
        assert_eq!(
            RecoveryConfig::enabled(6, 0, 5, 12).validate(),
            Err(ConfigError::Window(0))
        );
        assert_eq!(
            RecoveryConfig::enabled(6, 60, 0, 12).validate(),
            Err(ConfigError::RetryGap(0))
        );
        assert!(matches!(
            RecoveryConfig::enabled(6, 60, 61, 12).validate(),
            Err(ConfigError::RetryGapExceedsWindow { .. })
        ));
        assert!(matches!(
            RecoveryConfig::enabled(6, 60, 60, 12).validate(),
            Err(ConfigError::RetryGapExceedsWindow { .. })
        ));
        assert!(matches!(
            RecoveryConfig::enabled(6, 60, 5, 4).validate(),
            Err(ConfigError::LifetimeCount { .. })
        ));
        assert!(RecoveryConfig::enabled(2, 5, 1, 4).validate().is_ok());
        assert!(RecoveryConfig::enabled(6, 60, 1, 6).validate().is_ok());
    }

    #[test]
    fn test_parse_component_list() {
        assert_eq!(parse_component_list("A, D, F "), vec!["A", "D", "F"]);
        assert_eq!(parse_component_list(" A,,B ,"), vec!["A", "B"]);
        assert!(parse_component_list("").is_empty());
        assert!(parse_component_list(" , ").is_empty());
    }

    #[test]
    fn test_allow_list_takes_precedence() {
        let config = RecoveryConfig::enabled(6, 60, 5, 12)
            .with_enabled_components("A")
            .with_disabled_components("B");
        assert!(config.configured_for_recovery("A"));
        assert!(!config.configured_for_recovery("B"));
        assert!(!config.configured_for_recovery("C"));
    }

    #[test]
    fn test_deny_list_without_allow_list() {
        let config = RecoveryConfig::enabled(6, 60, 5, 12).with_disabled_components("B");
        assert!(config.configured_for_recovery("A"));
        assert!(!config.configured_for_recovery("B"));

        let open = RecoveryConfig::enabled(6, 60, 5, 12);
        assert!(open.configured_for_recovery("ANYTHING"));
    }

    #[test]
    fn test_policy_allowed_states() {
        assert_eq!(
            RecoveryPolicy::AutoStartOnly.allowed_current_states(),
            &[ComponentState::Installed]
        );
        assert!(RecoveryPolicy::Full
            .allowed_current_states()
            .contains(&ComponentState::Started));
        assert!(!RecoveryPolicy::AutoInstallStart
            .allowed_current_states()
            .contains(&ComponentState::Init));
    }

    #[test]
    fn test_registration_defaults() {
        let config = RegistrationRecoveryConfig::from_value(&json!({})).into_config();
        assert_eq!(config, RecoveryConfig::default());

        let config =
            RegistrationRecoveryConfig::from_value(&json!({"type": "DEFAULT"})).into_config();
        assert!(!config.recovery_enabled);

        let config = RegistrationRecoveryConfig::from_value(&json!({"type": "FULL"})).into_config();
        assert!(config.recovery_enabled);
        assert_eq!(config.policy, RecoveryPolicy::Full);
    }

    #[test]
    fn test_registration_non_numeric_falls_back() {
        let config = RegistrationRecoveryConfig::from_value(&json!({
            "type": "AUTO_START",
            "maxCount": "med",
            "windowInMinutes": [1],
        }))
        .into_config();
        assert!(config.recovery_enabled);
        assert!(config.auto_start_only());
        assert_eq!(config.max_count, DEFAULT_MAX_COUNT);
        assert_eq!(config.window_in_min, DEFAULT_WINDOW_IN_MIN);
    }

    #[test]
    fn test_registration_full_payload() {
        let config = RegistrationRecoveryConfig::from_value(&json!({
            "type": "AUTO_INSTALL_START",
            "maxCount": "5",
            "windowInMinutes": 20,
            "retryGap": 2,
            "maxLifetimeCount": 5.0,
            "components": " A,B",
            "disabledComponents": "C"
        }))
        .into_config();
        assert_eq!(config.max_count, 5);
        assert_eq!(config.window_in_min, 20);
        assert_eq!(config.retry_gap, 2);
        assert_eq!(config.max_lifetime_count, 5);
        assert!(config.auto_install_start());
        assert_eq!(config.enabled_components, vec!["A", "B"]);
        assert_eq!(config.disabled_components, vec!["C"]);
    }

    #[test]
    fn test_huge_thresholds_saturate() {
        let config = RegistrationRecoveryConfig::from_value(&json!({
            "type": "FULL",
            "windowInMinutes": 1e300,
            "retryGap": "9223372036854775807"
        }))
        .into_config();
        assert_eq!(config.window_in_min, i64::MAX);
        assert_eq!(config.window_in_sec(), i64::MAX);
        assert_eq!(config.retry_gap_in_sec(), i64::MAX);
    }

    #[test]
    fn test_registration_not_an_object() {
        let config = RegistrationRecoveryConfig::from_value(&json!("FULL")).into_config();
        assert_eq!(config, RecoveryConfig::default());
    }

    #[test]
    fn test_initial_config_from_options() {
        let options = ManagerOptions::new("/tmp/x")
            .recovery_enabled(true)
            .auto_start_only(true);
        let config = options.initial_config();
        assert!(config.recovery_enabled);
        assert!(config.auto_start_only());
        assert_eq!(config.max_count, DEFAULT_MAX_COUNT);
    }
}
