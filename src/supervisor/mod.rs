//! Process supervisor collaborator.
//!
//! The reconciler never starts nginx itself. It describes the service as a
//! [`Layer`], hands it to a [`Supervisor`] and asks for a replan. The
//! supervisor merges all registered layers into the [`Plan`] it is
//! currently running, which is what drift detection compares against.

use std::collections::BTreeMap;
use std::io;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod local;
pub use local::LocalSupervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Override {
    #[default]
    Replace,
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Startup {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RestartPolicy {
    #[default]
    Restart,
    Shutdown,
    Ignore,
}

/// A supervised process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ServiceDescriptor {
    #[serde(rename = "override")]
    pub override_mode: Override,
    pub summary: String,
    pub command: String,
    pub startup: Startup,
    pub on_failure: RestartPolicy,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckLevel {
    Alive,
    Ready,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpCheck {
    pub url: String,
}

/// A health check run by the supervisor against a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckDescriptor {
    #[serde(rename = "override")]
    pub override_mode: Override,
    pub level: CheckLevel,
    pub period: String,
    pub threshold: u32,
    pub http: HttpCheck,
}

/// One named contribution to the supervisor's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Layer {
    pub summary: String,
    pub description: String,
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescriptor>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckDescriptor>,
}

/// The merged view of all layers, i.e. what the supervisor runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescriptor>,
    #[serde(default)]
    pub checks: BTreeMap<String, CheckDescriptor>,
}

impl Plan {
    /// Fold a layer on top of this plan.
    ///
    /// `replace` entries overwrite whatever was there; `merge` entries
    /// extend the environment of an existing service.
    pub fn apply_layer(&mut self, layer: &Layer) {
        for (name, service) in &layer.services {
            match (service.override_mode, self.services.get_mut(name)) {
                (Override::Merge, Some(existing)) => {
                    existing.environment.extend(
                        service
                            .environment
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone())),
                    );
                    if !service.command.is_empty() {
                        existing.command = service.command.clone();
                    }
                    existing.startup = service.startup;
                    existing.on_failure = service.on_failure;
                }
                _ => {
                    self.services.insert(name.clone(), service.clone());
                }
            }
        }
        for (name, check) in &layer.checks {
            self.checks.insert(name.clone(), check.clone());
        }
    }
}

impl From<&Layer> for Plan {
    fn from(layer: &Layer) -> Self {
        let mut plan = Plan::default();
        plan.apply_layer(layer);
        plan
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("supervisor is not reachable: {0}")]
    Unavailable(String),
    #[error("failed to {op} {path}: {source}")]
    Io {
        op: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid layer in {path}: {source}")]
    Layer {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("replan failed: {0}")]
    Replan(String),
}

/// The primitives the reconciler needs from a process supervisor.
///
/// Every failure is treated as transient by the caller: the triggering
/// event is deferred and retried wholesale.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// The plan the supervisor is currently running.
    async fn current_plan(&self) -> Result<Plan, SupervisorError>;

    /// Write a file inside the workload, creating parent directories.
    async fn push_file(&self, path: &str, content: &str) -> Result<(), SupervisorError>;

    /// Create a directory inside the workload if it does not exist.
    async fn ensure_dir(&self, path: &str) -> Result<(), SupervisorError>;

    /// Register (or replace) a named layer.
    async fn add_layer(&self, name: &str, layer: &Layer) -> Result<(), SupervisorError>;

    /// Bring running services in line with the registered layers,
    /// restarting any that have stopped.
    async fn replan(&self) -> Result<(), SupervisorError>;

    /// Whether the named service is up.
    async fn service_running(&self, name: &str) -> Result<bool, SupervisorError>;
}
