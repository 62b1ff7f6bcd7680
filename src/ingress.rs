//! Ingress relation data produced for the ingress provider.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;

/// What the ingress provider needs to route traffic to the unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IngressConfig {
    pub service_hostname: String,
    pub service_name: String,
    pub service_port: u16,
    pub max_body_size: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
}

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to write ingress data to {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("failed to encode ingress data: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait IngressPublisher: Send + Sync {
    async fn publish(&self, config: &IngressConfig) -> Result<(), IngressError>;
}

/// Publishes the relation databag as a JSON document picked up by the
/// ingress provider.
pub struct FileIngressPublisher {
    path: PathBuf,
}

impl FileIngressPublisher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl IngressPublisher for FileIngressPublisher {
    async fn publish(&self, config: &IngressConfig) -> Result<(), IngressError> {
        let io_err = |source| IngressError::Io {
            path: self.path.display().to_string(),
            source,
        };
        let bytes = serde_json::to_vec_pretty(config)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await.map_err(io_err)?;
        }
        fs::write(&self.path, bytes).await.map_err(io_err)?;
        info!(
            "Published ingress data for {} -> {}:{}",
            config.service_hostname, config.service_name, config.service_port
        );
        Ok(())
    }
}
