//! Versioned key-value state persisted between dispatches.
//!
//! The dispatcher loads it before every trigger, hands a copy to the
//! reconciler inside the snapshot and writes back whatever the reconciler
//! returns. Nothing else keeps state across events.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::fs;

use crate::ingress::IngressConfig;
use crate::types::{Trigger, UnitStatus};

pub const STATE_VERSION: u32 = 1;

const KEY_DEFERRED: &str = "deferred";
const KEY_STATUS: &str = "status";
const KEY_INGRESS: &str = "ingress";

#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to access state file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid state document {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("state file {path} has version {found}, expected {}", STATE_VERSION)]
    Version { path: String, found: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredState {
    pub version: u32,
    #[serde(default)]
    pub values: BTreeMap<String, Value>,
}

impl Default for StoredState {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            values: BTreeMap::new(),
        }
    }
}

impl StoredState {
    /// Loads the state file, or an empty state if it does not exist yet.
    ///
    /// A corrupt or foreign-version document is logged and replaced by an
    /// empty state so later triggers can still run. Only I/O failures are
    /// returned.
    pub async fn load(path: &Path) -> Result<Self, StateError> {
        match Self::read(path).await {
            Err(err @ (StateError::Json { .. } | StateError::Version { .. })) => {
                warn!("Discarding stored state: {}", err);
                Ok(Self::default())
            }
            other => other,
        }
    }

    /// Strict variant of [`StoredState::load`].
    pub async fn read(path: &Path) -> Result<Self, StateError> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(StateError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let state: StoredState =
            serde_json::from_slice(&bytes).map_err(|source| StateError::Json {
                path: path.display().to_string(),
                source,
            })?;
        if state.version != STATE_VERSION {
            return Err(StateError::Version {
                path: path.display().to_string(),
                found: state.version,
            });
        }
        Ok(state)
    }

    /// Writes the state through a temporary file so a crash never leaves a
    /// half-written document behind.
    pub async fn save(&self, path: &Path) -> Result<(), StateError> {
        let io_err = |source| StateError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        let bytes = serde_json::to_vec_pretty(self).map_err(|source| StateError::Json {
            path: path.display().to_string(),
            source,
        })?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, bytes).await.map_err(io_err)?;
        fs::rename(&tmp, path).await.map_err(io_err)
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.values
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    fn set<T: Serialize>(&mut self, key: &str, value: &T) {
        match serde_json::to_value(value) {
            Ok(v) => {
                self.values.insert(key.to_string(), v);
            }
            Err(_) => {
                self.values.remove(key);
            }
        }
    }

    pub fn deferred(&self) -> Vec<Trigger> {
        self.get(KEY_DEFERRED).unwrap_or_default()
    }

    pub fn set_deferred(&mut self, triggers: &[Trigger]) {
        self.set(KEY_DEFERRED, &triggers);
    }

    pub fn status(&self) -> UnitStatus {
        self.get(KEY_STATUS).unwrap_or_default()
    }

    pub fn set_status(&mut self, status: &UnitStatus) {
        self.set(KEY_STATUS, status);
    }

    /// The ingress data most recently handed to the ingress provider.
    pub fn published_ingress(&self) -> Option<IngressConfig> {
        self.get(KEY_INGRESS)
    }

    pub fn set_published_ingress(&mut self, ingress: &IngressConfig) {
        self.set(KEY_INGRESS, ingress);
    }
}
