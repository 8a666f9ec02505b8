//! Recovery status report sent back to the controller.

use serde::{Deserialize, Serialize};

use crate::config::RecoveryConfig;
use crate::store::ActionMap;

/// Overall recoverability of the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecoverySummary {
    Disabled,
    Recoverable,
    /// Some tracked actions hit their lifetime cap.
    PartiallyRecoverable,
    /// Every tracked action hit its lifetime cap.
    Unrecoverable,
}

impl std::fmt::Display for RecoverySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Disabled => "DISABLED",
            Self::Recoverable => "RECOVERABLE",
            Self::PartiallyRecoverable => "PARTIALLY_RECOVERABLE",
            Self::Unrecoverable => "UNRECOVERABLE",
        };
        f.write_str(name)
    }
}

/// Attempt summary for one action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentReport {
    pub name: String,
    pub num_attempts: i64,
    pub limit_reached: bool,
}

/// Recovery status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryReport {
    pub summary: RecoverySummary,
    /// Absent when recovery is disabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_reports: Option<Vec<ComponentReport>>,
}

impl RecoveryReport {
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            summary: RecoverySummary::Disabled,
            component_reports: None,
        }
    }

    /// Build the report for `actions`, ordered by action name.
    #[must_use]
    pub fn from_actions(actions: &ActionMap, config: &RecoveryConfig) -> Self {
        if !config.recovery_enabled {
            return Self::disabled();
        }

        let reports: Vec<ComponentReport> = actions
            .iter()
            .map(|(name, counter)| ComponentReport {
                name: name.clone(),
                num_attempts: counter.lifetime_count,
                limit_reached: counter.limit_reached(config),
            })
            .collect();

        let limits_reached = reports.iter().filter(|r| r.limit_reached).count();
        let summary = if limits_reached == 0 {
            RecoverySummary::Recoverable
        } else if limits_reached == reports.len() {
            RecoverySummary::Unrecoverable
        } else {
            RecoverySummary::PartiallyRecoverable
        };

        Self {
            summary,
            component_reports: Some(reports),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::ActionCounter;
    use serde_json::json;

    fn actions(lifetimes: &[(&str, i64)]) -> ActionMap {
        lifetimes
            .iter()
            .map(|(name, lifetime_count)| {
                (
                    (*name).to_string(),
                    ActionCounter {
                        lifetime_count: *lifetime_count,
                        ..ActionCounter::default()
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_disabled_report_has_no_components() {
        let report = RecoveryReport::from_actions(&actions(&[("A", 1)]), &RecoveryConfig::default());
        assert_eq!(serde_json::to_value(&report).unwrap(), json!({"summary": "DISABLED"}));
    }

    #[test]
    fn test_summary_levels() {
        let config = RecoveryConfig::enabled(2, 5, 1, 4);

        let report = RecoveryReport::from_actions(&ActionMap::new(), &config);
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"summary": "RECOVERABLE", "componentReports": []})
        );

        let report = RecoveryReport::from_actions(&actions(&[("PUMA", 4), ("LION", 3)]), &config);
        assert_eq!(report.summary, RecoverySummary::PartiallyRecoverable);
        assert_eq!(
            serde_json::to_value(&report).unwrap(),
            json!({"summary": "PARTIALLY_RECOVERABLE", "componentReports": [
                {"name": "LION", "numAttempts": 3, "limitReached": false},
                {"name": "PUMA", "numAttempts": 4, "limitReached": true}
            ]})
        );

        let report = RecoveryReport::from_actions(&actions(&[("PUMA", 4), ("LION", 4)]), &config);
        assert_eq!(report.summary, RecoverySummary::Unrecoverable);
    }
}
