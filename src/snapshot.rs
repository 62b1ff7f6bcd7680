//! The immutable input of a reconciliation.
//!
//! A [`ConfigSnapshot`] is assembled from the loaded [`Config`] and the
//! stored state every time a trigger is dispatched. Nothing mutates it
//! afterwards and it is never written back anywhere.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::state::StoredState;

/// Declarative settings of the unit.
///
/// String fields are passed to nginx verbatim; an empty string means
/// "unset" and is treated like a missing key.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct CharmConfig {
    pub backend: String,
    pub site: String,
    pub backend_site_name: String,
    pub cache_max_size: String,
    pub cache_inactive_time: String,
    pub cache_valid: String,
    pub cache_use_stale: String,
    pub client_max_body_size: String,
    /// When false, upstream `Cache-Control` and `Expires` headers are ignored.
    pub cache_all: bool,
    pub proxy_cache_lock: bool,
    pub proxy_cache_lock_age: String,
    pub proxy_cache_lock_timeout: String,
    pub proxy_cache_revalidate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

impl Default for CharmConfig {
    fn default() -> Self {
        Self {
            backend: String::new(),
            site: String::new(),
            backend_site_name: String::new(),
            cache_max_size: "10G".into(),
            cache_inactive_time: "10m".into(),
            cache_valid: "200 1h".into(),
            cache_use_stale: "error timeout updating http_500 http_502 http_503 http_504".into(),
            client_max_body_size: "1m".into(),
            cache_all: false,
            proxy_cache_lock: true,
            proxy_cache_lock_age: "5s".into(),
            proxy_cache_lock_timeout: "5s".into(),
            proxy_cache_revalidate: true,
            tls_secret_name: None,
        }
    }
}

/// Data published by the related application over the peer relation.
///
/// Every field is optional because the remote side fills the databag in
/// several steps; see [`PeerRelation::missing_fields`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerRelation {
    pub service_hostname: Option<String>,
    pub service_name: Option<String>,
    pub service_port: Option<u16>,
    /// Remote unit names, e.g. `hello-kubecon/0`.
    #[serde(default)]
    pub units: Vec<String>,
}

impl PeerRelation {
    /// Names of the relation keys that have not been published yet.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if is_blank(self.service_hostname.as_deref()) {
            missing.push("service-hostname");
        }
        if is_blank(self.service_name.as_deref()) {
            missing.push("service-name");
        }
        if self.service_port.is_none() {
            missing.push("service-port");
        }
        if self.units.is_empty() {
            missing.push("units");
        }
        missing
    }
}

fn is_blank(value: Option<&str>) -> bool {
    value.map_or(true, |v| v.trim().is_empty())
}

/// Who we are inside the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub app_name: String,
    pub unit_name: String,
    pub namespace: String,
}

/// Paths inside the workload that the rendered plan refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadPaths {
    pub site_config: String,
    pub cache_dir: String,
}

#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub identity: Identity,
    pub charm: CharmConfig,
    pub peer_relation: Option<PeerRelation>,
    pub paths: WorkloadPaths,
    pub stored: StoredState,
}

impl ConfigSnapshot {
    pub fn capture(config: &Config, stored: &StoredState) -> Self {
        Self {
            identity: Identity {
                app_name: config.app_name.clone(),
                unit_name: config.unit_name.clone(),
                namespace: config.namespace.clone(),
            },
            charm: config.charm.clone(),
            peer_relation: config.relation.clone(),
            paths: WorkloadPaths {
                site_config: config.paths.site_config.clone(),
                cache_dir: config.paths.cache_dir.clone(),
            },
            stored: stored.clone(),
        }
    }
}
