//! Component lifecycle states.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a host component as reported by the controller or by
/// local status checks.
///
/// Values outside the known set are kept verbatim so they round-trip and so a
/// desired state of e.g. `"START"` never accidentally matches `STARTED`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ComponentState {
    /// No state recorded yet (empty string on the wire).
    #[default]
    Unknown,
    Init,
    Installed,
    Started,
    InstallFailed,
    Other(String),
}

impl ComponentState {
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Unknown => "",
            Self::Init => "INIT",
            Self::Installed => "INSTALLED",
            Self::Started => "STARTED",
            Self::InstallFailed => "INSTALL_FAILED",
            Self::Other(s) => s,
        }
    }
}

impl From<&str> for ComponentState {
    fn from(value: &str) -> Self {
        match value {
            "" => Self::Unknown,
            "INIT" => Self::Init,
            "INSTALLED" => Self::Installed,
            "STARTED" => Self::Started,
            "INSTALL_FAILED" => Self::InstallFailed,
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<String> for ComponentState {
    fn from(value: String) -> Self {
        Self::from(value.as_str())
    }
}

impl From<ComponentState> for String {
    fn from(value: ComponentState) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ComponentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracked state of one component.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentStatus {
    pub current: ComponentState,
    pub desired: ComponentState,
    pub stale_config: bool,
}

impl ComponentStatus {
    /// A component is settled once it is where the controller wants it and
    /// runs with up-to-date configuration.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.current == self.desired && !self.stale_config
    }
}
