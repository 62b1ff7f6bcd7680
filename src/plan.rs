//! Turns a [`ConfigSnapshot`] into the desired state of the workload.
//!
//! Everything in here is a pure function of the snapshot: no I/O, no
//! clock. The reconciler owns all side effects.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use md5::{Digest, Md5};
use thiserror::Error;
use url::Url;

use crate::ingress::IngressConfig;
use crate::snapshot::{ConfigSnapshot, PeerRelation};
use crate::supervisor::{
    CheckDescriptor, CheckLevel, HttpCheck, Layer, Override, Plan, RestartPolicy,
    ServiceDescriptor, Startup,
};
use crate::template;

pub const CONTAINER_NAME: &str = "content-cache";
pub const CONTAINER_PORT: u16 = 80;
const NGINX_COMMAND: &str = "/usr/sbin/nginx -g 'daemon off;'";
const CACHE_ALL_DIRECTIVE: &str = "proxy_ignore_headers Cache-Control Expires;";
const CLUSTER_DOMAIN: &str = "svc.cluster.local";

/// Direct settings that must be non-empty when no relation supplies them.
const REQUIRED_CONFIGS: &[&str] = &["backend"];

pub const TIME_GRAMMAR: &str =
    "<number><unit>, optionally repeated and separated by spaces, unit one of ms, s, m, h, d, w, M, y";

static TIME_FORMAT: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^\d+(?:ms|s|m|h|d|w|M|y)(?:\s+\d+(?:ms|s|m|h|d|w|M|y))*$").ok()
});

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Required config(s) empty: {}", .fields.join(", "))]
    MissingRequiredConfig { fields: Vec<String> },
    #[error("Waiting for relation data: {}", .missing.join(", "))]
    IncompleteRelationData { missing: Vec<&'static str> },
    #[error("Invalid time format for {field}: {value:?}, expected {}", TIME_GRAMMAR)]
    InvalidTimeFormat { field: &'static str, value: String },
    #[error("Invalid backend URL {value:?}: no host name")]
    InvalidBackendUrl { value: String },
}

impl ValidationError {
    /// Whether the condition clears on its own, as opposed to needing an
    /// operator to fix the configuration.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ValidationError::IncompleteRelationData { .. })
    }
}

/// The full desired state for one reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPlan {
    pub env: BTreeMap<String, String>,
    pub proxy_config_text: String,
    pub layer: Layer,
    pub ingress: IngressConfig,
    pub site_config_path: String,
    pub cache_path: String,
}

impl DesiredPlan {
    /// The plan the supervisor should end up running.
    pub fn service_plan(&self) -> Plan {
        Plan::from(&self.layer)
    }
}

/// Backend and site after relation/config precedence is applied.
struct Endpoints {
    backend: String,
    site: String,
}

pub fn build(snapshot: &ConfigSnapshot) -> Result<DesiredPlan, ValidationError> {
    let endpoints = resolve_endpoints(snapshot)?;
    let charm = &snapshot.charm;

    validate_time("proxy_cache_lock_age", &charm.proxy_cache_lock_age)?;
    validate_time("proxy_cache_lock_timeout", &charm.proxy_cache_lock_timeout)?;

    let backend_site_name = if charm.backend_site_name.trim().is_empty() {
        backend_host(&endpoints.backend)?
    } else {
        charm.backend_site_name.clone()
    };

    let env = make_env(snapshot, &endpoints, backend_site_name);
    let proxy_config_text = template::render_site_config(&env);
    let layer = make_layer(env.clone());
    let ingress = IngressConfig {
        service_hostname: endpoints.site.clone(),
        service_name: snapshot.identity.app_name.clone(),
        service_port: CONTAINER_PORT,
        max_body_size: or_default(&charm.client_max_body_size, "1m"),
        tls_secret_name: charm
            .tls_secret_name
            .clone()
            .filter(|name| !name.trim().is_empty()),
    };

    Ok(DesiredPlan {
        env,
        proxy_config_text,
        layer,
        ingress,
        site_config_path: snapshot.paths.site_config.clone(),
        cache_path: snapshot.paths.cache_dir.clone(),
    })
}

/// Sorted, deduplicated names of required settings that are empty.
pub fn missing_configs(snapshot: &ConfigSnapshot) -> Vec<String> {
    let mut missing: Vec<String> = REQUIRED_CONFIGS
        .iter()
        .filter(|name| config_value(snapshot, name).map_or(true, |v| v.trim().is_empty()))
        .map(|name| name.to_string())
        .collect();
    missing.sort();
    missing.dedup();
    missing
}

fn config_value<'a>(snapshot: &'a ConfigSnapshot, name: &str) -> Option<&'a str> {
    let charm = &snapshot.charm;
    match name {
        "backend" => Some(charm.backend.as_str()),
        _ => None,
    }
}

fn resolve_endpoints(snapshot: &ConfigSnapshot) -> Result<Endpoints, ValidationError> {
    if let Some(relation) = &snapshot.peer_relation {
        return relation_endpoints(relation, &snapshot.identity.namespace);
    }

    let missing = missing_configs(snapshot);
    if !missing.is_empty() {
        return Err(ValidationError::MissingRequiredConfig { fields: missing });
    }

    let site = if snapshot.charm.site.trim().is_empty() {
        snapshot.identity.app_name.clone()
    } else {
        snapshot.charm.site.clone()
    };
    Ok(Endpoints {
        backend: snapshot.charm.backend.clone(),
        site,
    })
}

fn relation_endpoints(
    relation: &PeerRelation,
    namespace: &str,
) -> Result<Endpoints, ValidationError> {
    let missing = relation.missing_fields();
    if !missing.is_empty() {
        return Err(ValidationError::IncompleteRelationData { missing });
    }

    match (
        &relation.service_hostname,
        &relation.service_name,
        relation.service_port,
        relation.units.first(),
    ) {
        (Some(hostname), Some(service), Some(port), Some(unit)) => Ok(Endpoints {
            backend: format!(
                "http://{}.{}-endpoints.{}.{}:{}",
                unit.replace('/', "-"),
                service,
                namespace,
                CLUSTER_DOMAIN,
                port
            ),
            site: hostname.clone(),
        }),
        _ => Err(ValidationError::IncompleteRelationData {
            missing: relation.missing_fields(),
        }),
    }
}

/// Checks a value against the nginx time grammar.
pub fn validate_time(field: &'static str, value: &str) -> Result<(), ValidationError> {
    let valid = TIME_FORMAT
        .as_ref()
        .is_some_and(|re| re.is_match(value.trim()));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidTimeFormat {
            field,
            value: value.to_string(),
        })
    }
}

/// Name of the nginx cache key zone for a site.
///
/// Only the first 12 hex characters of the digest are kept, so two sites
/// can in principle share a zone name.
pub fn keys_zone(site: &str) -> String {
    let digest = hex::encode(Md5::digest(site.as_bytes()));
    format!("{}-cache", &digest[..12])
}

fn backend_host(backend: &str) -> Result<String, ValidationError> {
    Url::parse(backend)
        .ok()
        .and_then(|url| url.host_str().map(str::to_string))
        .ok_or_else(|| ValidationError::InvalidBackendUrl {
            value: backend.to_string(),
        })
}

fn or_default(value: &str, default: &str) -> String {
    if value.trim().is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

fn on_off(flag: bool) -> String {
    let value = if flag { "on" } else { "off" };
    value.to_string()
}

fn make_env(
    snapshot: &ConfigSnapshot,
    endpoints: &Endpoints,
    backend_site_name: String,
) -> BTreeMap<String, String> {
    let charm = &snapshot.charm;
    let identity = &snapshot.identity;
    let cache_all = if charm.cache_all {
        String::new()
    } else {
        CACHE_ALL_DIRECTIVE.to_string()
    };

    [
        ("CONTAINER_PORT", CONTAINER_PORT.to_string()),
        ("CONTENT_CACHE_BACKEND", endpoints.backend.clone()),
        ("CONTENT_CACHE_SITE", endpoints.site.clone()),
        ("CONTENT_CACHE_POD_NAME", identity.unit_name.clone()),
        ("CONTENT_CACHE_POD_NAMESPACE", identity.namespace.clone()),
        ("CONTENT_CACHE_POD_SERVICE_ACCOUNT", identity.app_name.clone()),
        ("NGINX_BACKEND", endpoints.backend.clone()),
        ("NGINX_BACKEND_SITE_NAME", backend_site_name),
        ("NGINX_CACHE_ALL", cache_all),
        (
            "NGINX_CACHE_INACTIVE_TIME",
            or_default(&charm.cache_inactive_time, "10m"),
        ),
        ("NGINX_CACHE_LOCK", on_off(charm.proxy_cache_lock)),
        ("NGINX_CACHE_LOCK_AGE", charm.proxy_cache_lock_age.trim().to_string()),
        (
            "NGINX_CACHE_LOCK_TIMEOUT",
            charm.proxy_cache_lock_timeout.trim().to_string(),
        ),
        ("NGINX_CACHE_MAX_SIZE", or_default(&charm.cache_max_size, "10G")),
        ("NGINX_CACHE_PATH", snapshot.paths.cache_dir.clone()),
        ("NGINX_CACHE_REVALIDATE", on_off(charm.proxy_cache_revalidate)),
        ("NGINX_CACHE_USE_STALE", charm.cache_use_stale.clone()),
        ("NGINX_CACHE_VALID", charm.cache_valid.clone()),
        (
            "NGINX_CLIENT_MAX_BODY_SIZE",
            or_default(&charm.client_max_body_size, "1m"),
        ),
        ("NGINX_KEYS_ZONE", keys_zone(&endpoints.site)),
        ("NGINX_SITE_NAME", endpoints.site.clone()),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn make_layer(env: BTreeMap<String, String>) -> Layer {
    let mut services = BTreeMap::new();
    services.insert(
        CONTAINER_NAME.to_string(),
        ServiceDescriptor {
            override_mode: Override::Replace,
            summary: CONTAINER_NAME.to_string(),
            command: NGINX_COMMAND.to_string(),
            startup: Startup::Enabled,
            on_failure: RestartPolicy::Restart,
            environment: env,
        },
    );

    let mut checks = BTreeMap::new();
    checks.insert(
        format!("{CONTAINER_NAME}-up"),
        CheckDescriptor {
            override_mode: Override::Replace,
            level: CheckLevel::Ready,
            period: "10s".into(),
            threshold: 3,
            http: HttpCheck {
                url: format!("http://localhost:{CONTAINER_PORT}/"),
            },
        },
    );

    Layer {
        summary: format!("{CONTAINER_NAME} layer"),
        description: format!("Supervisor config layer for {CONTAINER_NAME}"),
        services,
        checks,
    }
}
