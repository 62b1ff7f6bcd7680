use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::snapshot::{CharmConfig, PeerRelation};

const DEFAULT_CONFIG_FILE: &str = "content-cache.toml";
const DEFAULT_JSON_FILE: &str = "content-cache.json";
const ENV_PREFIX: &str = "CONTENT_CACHE_";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Paths {
    /// Where the rendered nginx site lands inside the workload.
    pub site_config: String,
    pub cache_dir: String,
    pub access_log: PathBuf,
    pub state_file: PathBuf,
    pub ingress_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Workload filesystem root that pushed files are written below.
    pub root: PathBuf,
    pub layers_dir: PathBuf,
    #[serde(default)]
    pub reload_command: Vec<String>,
    /// Exits successfully while the named service is up.
    #[serde(default)]
    pub status_command: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub app_name: String,
    pub unit_name: String,
    pub namespace: String,
    pub charm: CharmConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation: Option<PeerRelation>,
    /// JSON databag written by the relation agent; overrides `relation`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_file: Option<PathBuf>,
    pub paths: Paths,
    pub supervisor: SupervisorConfig,
    pub retry_after_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            app_name: "content-cache".into(),
            unit_name: "content-cache/0".into(),
            namespace: "default".into(),
            charm: CharmConfig::default(),
            relation: None,
            relation_file: None,
            paths: Paths {
                site_config: "/etc/nginx/sites-enabled/default".into(),
                cache_dir: "/var/lib/nginx/proxy/cache".into(),
                access_log: "/var/log/nginx/access.log".into(),
                state_file: "/var/lib/content-cache/state.json".into(),
                ingress_file: "/var/lib/content-cache/ingress.json".into(),
            },
            supervisor: SupervisorConfig {
                root: "/".into(),
                layers_dir: "/var/lib/content-cache/layers".into(),
                reload_command: Vec::new(),
                status_command: Vec::new(),
            },
            retry_after_secs: 5,
        }
    }
}

impl Config {
    /// Layers defaults, the TOML file (`path` or `content-cache.toml`),
    /// `content-cache.json` and `CONTENT_CACHE_*` environment variables,
    /// later sources winning. Nested keys use `__` in variable names, e.g.
    /// `CONTENT_CACHE_CHARM__BACKEND`.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let toml_file = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        let mut config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(toml_file))
            .merge(Json::file(DEFAULT_JSON_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        if let Some(ref relation_file) = config.relation_file {
            config.relation = read_relation(relation_file)?;
        }

        Ok(config)
    }

    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_secs)
    }
}

/// A missing databag means the relation has not been established yet.
fn read_relation(path: &Path) -> anyhow::Result<Option<PeerRelation>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid relation data in {}: {}", path.display(), e)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow::anyhow!(
            "Failed to read relation data {}: {}",
            path.display(),
            e
        )),
    }
}
