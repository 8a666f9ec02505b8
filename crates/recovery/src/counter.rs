//! Per-action attempt throttling.
//!
//! Each recovery action (in practice one per component) owns an
//! [`ActionCounter`]. The counter is a small state machine:
//!
//! - [`GateState::Active`]: below both the window cap and the lifetime cap.
//!   An attempt is recorded once more than `retry_gap` minutes have passed
//!   since the last one.
//! - [`GateState::WindowExhausted`]: `max_count` attempts used in the current
//!   window. Opens again once more than `window_in_min` minutes have passed
//!   since the window was last reset.
//! - [`GateState::LifetimeExhausted`]: terminal for the life of the process.
//!
//! All thresholds are strict: reaching a boundary exactly is not enough.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::config::RecoveryConfig;

/// Where an action counter stands against the configured caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Active,
    WindowExhausted,
    LifetimeExhausted,
}

/// Attempt bookkeeping for one action. Field names are the on-disk format.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCounter {
    /// Epoch seconds of the last recorded attempt.
    pub last_attempt: i64,
    /// Attempts in the current window.
    pub count: i64,
    /// Epoch seconds when the window last reset.
    pub last_reset: i64,
    /// Attempts over the process lifetime.
    pub lifetime_count: i64,
    pub warned_last_attempt: bool,
    pub warned_last_reset: bool,
    pub warned_threshold_reached: bool,
}

impl ActionCounter {
    #[must_use]
    pub fn state(&self, config: &RecoveryConfig) -> GateState {
        if self.lifetime_count >= config.max_lifetime_count {
            GateState::LifetimeExhausted
        } else if self.count >= config.max_count {
            GateState::WindowExhausted
        } else {
            GateState::Active
        }
    }

    #[must_use]
    pub fn limit_reached(&self, config: &RecoveryConfig) -> bool {
        self.state(config) == GateState::LifetimeExhausted
    }

    /// Whether an attempt at `now` would be recorded, without changing
    /// anything.
    #[must_use]
    pub fn may_attempt(&self, now: i64, config: &RecoveryConfig) -> bool {
        let since_last_attempt = now.saturating_sub(self.last_attempt);
        match self.state(config) {
            GateState::Active => since_last_attempt > config.retry_gap_in_sec(),
            GateState::WindowExhausted => now.saturating_sub(self.last_reset) > config.window_in_sec(),
            GateState::LifetimeExhausted => false,
        }
    }

    /// Try to record an attempt at `now`. Returns `true` when the attempt was
    /// recorded.
    pub fn try_attempt(&mut self, action: &str, now: i64, config: &RecoveryConfig) -> bool {
        if self.state(config) == GateState::LifetimeExhausted {
            self.warn_lifetime_exhausted(action);
            return false;
        }

        let since_last_attempt = now.saturating_sub(self.last_attempt);
        if since_last_attempt > config.window_in_sec() {
            self.count = 0;
            self.last_reset = now;
            self.warned_last_reset = false;
        }

        if self.state(config) == GateState::Active {
            if since_last_attempt > config.retry_gap_in_sec() {
                self.count += 1;
                self.lifetime_count += 1;
                if config.retry_gap > 0 {
                    self.last_attempt = now;
                }
                self.warned_last_attempt = false;
                if self.count == 1 {
                    self.last_reset = now;
                }
                return true;
            }

            if self.warned_last_attempt {
                debug!(
                    "{} seconds has not passed since last occurrence {} seconds back for {}",
                    config.retry_gap_in_sec(),
                    since_last_attempt,
                    action
                );
            } else {
                self.warned_last_attempt = true;
                warn!(
                    "{} seconds has not passed since last occurrence {} seconds back for {}. \
                     Will silently skip execution without warning till retry gap is passed",
                    config.retry_gap_in_sec(),
                    since_last_attempt,
                    action
                );
            }
            return false;
        }

        if now.saturating_sub(self.last_reset) > config.window_in_sec() {
            self.count = 1;
            self.lifetime_count += 1;
            if config.retry_gap > 0 {
                self.last_attempt = now;
            }
            self.last_reset = now;
            self.warned_last_reset = false;
            return true;
        }

        if self.warned_last_reset {
            debug!(
                "{} occurrences in {} minutes reached the limit for {}",
                self.count, config.window_in_min, action
            );
        } else {
            self.warned_last_reset = true;
            warn!(
                "{} occurrences in {} minutes reached the limit for {}. \
                 Will silently skip execution without warning till window is reset",
                self.count, config.window_in_min, action
            );
        }
        false
    }

    /// True when the last attempt is older than one window.
    #[must_use]
    pub fn is_stale(&self, now: i64, config: &RecoveryConfig) -> bool {
        now.saturating_sub(self.last_attempt) > config.window_in_sec()
    }

    fn warn_lifetime_exhausted(&mut self, action: &str) {
        if self.warned_threshold_reached {
            error!(
                "{} occurrences in agent life time reached the limit for {}",
                self.lifetime_count, action
            );
        } else {
            self.warned_threshold_reached = true;
            warn!(
                "{} occurrences in agent life time reached the limit for {}. \
                 Will silently skip execution without warning till window is reset",
                self.lifetime_count, action
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2 attempts per 5 minute window, 1 minute gap, 4 over the lifetime
    fn config() -> RecoveryConfig {
        RecoveryConfig::enabled(2, 5, 1, 4)
    }

    #[test]
    fn test_first_attempt_opens_window() {
        let config = config();
        let mut counter = ActionCounter::default();
        assert!(counter.may_attempt(1000, &config));
        assert!(counter.try_attempt("NODEMANAGER", 1000, &config));
        assert_eq!(counter.count, 1);
        assert_eq!(counter.lifetime_count, 1);
        assert_eq!(counter.last_attempt, 1000);
        assert_eq!(counter.last_reset, 1000);
    }

    #[test]
    fn test_retry_gap_is_strict() {
        let config = config();
        let mut counter = ActionCounter::default();
        assert!(counter.try_attempt("A", 1000, &config));
        assert!(!counter.try_attempt("A", 1001, &config));
        assert!(counter.warned_last_attempt);
        assert!(!counter.try_attempt("A", 1060, &config));
        assert!(counter.try_attempt("A", 1061, &config));
        assert!(!counter.warned_last_attempt);
    }

    #[test]
    fn test_window_exhaustion_and_rollover() {
        let config = config();
        let mut counter = ActionCounter::default();
        assert!(counter.try_attempt("A", 1003, &config));
        assert!(counter.try_attempt("A", 1071, &config));
        assert_eq!(counter.state(&config), GateState::WindowExhausted);

        assert!(!counter.try_attempt("A", 1150, &config));
        assert!(counter.warned_last_reset);
        assert!(!counter.may_attempt(1151, &config));

        // more than one window since the last attempt resets the window
        assert!(counter.try_attempt("A", 1400, &config));
        assert_eq!(counter.count, 1);
        assert_eq!(counter.last_reset, 1400);
        assert!(!counter.may_attempt(1401, &config));
    }

    #[test]
    fn test_exhausted_window_reopens_from_last_reset() {
        let config = config();
        let mut counter = ActionCounter {
            last_attempt: 1250,
            count: 2,
            last_reset: 1000,
            lifetime_count: 2,
            ..ActionCounter::default()
        };
        // 300s since reset is not enough
        assert!(!counter.may_attempt(1300, &config));
        assert!(!counter.try_attempt("A", 1300, &config));
        assert!(counter.may_attempt(1301, &config));
        assert!(counter.try_attempt("A", 1301, &config));
        assert_eq!(counter.count, 1);
        assert_eq!(counter.lifetime_count, 3);
        assert_eq!(counter.last_reset, 1301);
        assert_eq!(counter.last_attempt, 1301);
    }

    #[test]
    fn test_lifetime_cap_is_terminal() {
        let config = config();
        let mut counter = ActionCounter::default();
        let mut now = 1000;
        let mut successes = 0;
        let mut previous = 0;
        for _ in 0..(config.max_lifetime_count + 5) {
            if counter.try_attempt("A", now, &config) {
                successes += 1;
            }
            assert!(counter.lifetime_count >= previous);
            previous = counter.lifetime_count;
            now += 400;
        }
        assert_eq!(successes, config.max_lifetime_count);
        assert_eq!(counter.state(&config), GateState::LifetimeExhausted);
        assert!(counter.warned_threshold_reached);
        assert!(!counter.may_attempt(now + 100_000, &config));
        assert!(!counter.try_attempt("A", now + 100_000, &config));
        assert_eq!(counter.lifetime_count, config.max_lifetime_count);
    }

    #[test]
    fn test_zero_retry_gap_never_moves_last_attempt() {
        // not reachable through validation, exercised directly
        let config = RecoveryConfig {
            retry_gap: 0,
            ..RecoveryConfig::enabled(3, 5, 1, 10)
        };
        let mut counter = ActionCounter::default();
        assert!(counter.try_attempt("A", 1000, &config));
        assert!(counter.try_attempt("A", 1000, &config));
        assert_eq!(counter.last_attempt, 0);
        // the stale last attempt rolls the window over on every call
        assert_eq!(counter.count, 1);
        assert_eq!(counter.lifetime_count, 2);
    }

    #[test]
    fn test_stale() {
        let config = RecoveryConfig::enabled(5, 60, 5, 16);
        let counter = ActionCounter {
            last_attempt: 1,
            count: 1,
            lifetime_count: 1,
            ..ActionCounter::default()
        };
        assert!(!counter.is_stale(3601, &config));
        assert!(counter.is_stale(3602, &config));
    }

    #[test]
    fn test_extreme_restored_timestamps() {
        let config = config();
        let mut counter = ActionCounter {
            last_attempt: i64::MIN,
            last_reset: i64::MIN,
            ..ActionCounter::default()
        };
        assert!(counter.is_stale(1000, &config));
        assert!(counter.may_attempt(1000, &config));
        assert!(counter.try_attempt("A", 1000, &config));
        assert_eq!(counter.last_reset, 1000);

        // a last attempt in the future keeps the gate shut
        let mut counter = ActionCounter {
            last_attempt: i64::MAX,
            ..ActionCounter::default()
        };
        assert!(!counter.may_attempt(i64::MIN, &config));
        assert!(!counter.try_attempt("A", i64::MIN, &config));
    }

    #[test]
    fn test_serialized_field_names() {
        let value = serde_json::to_value(ActionCounter::default()).unwrap();
        for key in [
            "lastAttempt",
            "count",
            "lastReset",
            "lifetimeCount",
            "warnedLastAttempt",
            "warnedLastReset",
            "warnedThresholdReached",
        ] {
            assert!(value.get(key).is_some(), "missing {key}");
        }
    }
}
