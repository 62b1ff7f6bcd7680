//! Data structures shared by the reconciler, the dispatcher and the
//! stored state.
//!
//! Triggers and statuses are serialised with [`serde`](https://serde.rs/)
//! because deferred triggers and the last visible status survive process
//! restarts through the stored state file.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Actions exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionName {
    ReportVisitsByIp,
}

impl ActionName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionName::ReportVisitsByIp => "report-visits-by-ip",
        }
    }
}

/// Everything that can wake the unit up.
///
/// All lifecycle kinds go through the same reconciliation entry point;
/// `ActionInvoked` is routed to the action handlers instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Trigger {
    ConfigChanged,
    UpgradeCharm,
    RelationChanged,
    SupervisorReady,
    ActionInvoked(ActionName),
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::ConfigChanged => "config-changed",
            Trigger::UpgradeCharm => "upgrade-charm",
            Trigger::RelationChanged => "relation-changed",
            Trigger::SupervisorReady => "supervisor-ready",
            Trigger::ActionInvoked(action) => action.as_str(),
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "config-changed" => Ok(Trigger::ConfigChanged),
            "upgrade-charm" => Ok(Trigger::UpgradeCharm),
            "relation-changed" => Ok(Trigger::RelationChanged),
            "supervisor-ready" => Ok(Trigger::SupervisorReady),
            "report-visits-by-ip" => Ok(Trigger::ActionInvoked(ActionName::ReportVisitsByIp)),
            other => Err(format!("unknown trigger: {other}")),
        }
    }
}

/// The externally visible status of the unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "lowercase")]
pub enum UnitStatus {
    /// Nothing has been reconciled yet.
    #[default]
    Unknown,
    Maintenance(String),
    Blocked(String),
    Waiting(String),
    Active(String),
}

impl UnitStatus {
    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Unknown => "",
            UnitStatus::Maintenance(msg)
            | UnitStatus::Blocked(msg)
            | UnitStatus::Waiting(msg)
            | UnitStatus::Active(msg) => msg,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            UnitStatus::Unknown => return f.write_str("unknown"),
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Blocked(_) => "blocked",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Active(_) => "active",
        };
        write!(f, "{}: {}", kind, self.message())
    }
}
