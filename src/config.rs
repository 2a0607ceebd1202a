//! The service configuration file.
//!
//! ```toml
//! bind = "0.0.0.0:8080"
//! encryption_key = "<64 hex characters>"
//! admin_token = "operator-secret"
//!
//! [custody]
//! threshold = 2
//! node_timeout_ms = 3000
//! auto_reshare = true
//! health_check_interval_secs = 30
//!
//! [[nodes]]
//! node_id = "ks-1"
//! node_name = "first"
//! server_url = "http://127.0.0.1:9001"
//!
//! [[identities]]
//! token = "alice-token"
//! user_id = "alice"
//! email = "alice@example.com"
//! ```
use std::{net::SocketAddr, path::Path, time::Duration};

use serde::Deserialize;
use thiserror::Error;

use crate::{
    cipher::ShareCipher,
    identity::TokenGrant,
    model::{KeyShareNode, KeyShareNodeMeta, NodeId, NodeStatus},
    store::{NodeStore, StoreError},
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_health_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustodyConfig {
    pub threshold: usize,
    #[serde(default = "default_timeout_ms")]
    pub node_timeout_ms: u64,
    #[serde(default)]
    pub auto_reshare: bool,
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    pub node_id: String,
    #[serde(default)]
    pub node_name: Option<String>,
    pub server_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,
    /// The AES-256 key sealing shares, as hex.
    pub encryption_key: String,
    #[serde(default)]
    pub admin_token: String,
    pub custody: CustodyConfig,
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
    #[serde(default)]
    pub identities: Vec<TokenGrant>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        content.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let n = self.nodes.len();
        if self.custody.threshold < 1 || self.custody.threshold > n {
            return Err(ConfigError::Invalid(format!(
                "threshold {} must be between 1 and the node count {n}",
                self.custody.threshold
            )));
        }
        let mut ids: Vec<_> = self.nodes.iter().map(|n| n.node_id.as_str()).collect();
        ids.sort_unstable();
        ids.dedup();
        if ids.len() != n {
            return Err(ConfigError::Invalid("node ids must be unique".to_string()));
        }
        if self.custody.node_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "node_timeout_ms must be positive".to_string(),
            ));
        }
        self.cipher()?;
        Ok(())
    }

    pub fn cipher(&self) -> Result<ShareCipher, ConfigError> {
        ShareCipher::from_hex(&self.encryption_key)
            .map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_millis(self.custody.node_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.custody.health_check_interval_secs.max(1))
    }

    /// Write the configured nodes and threshold into a store.
    ///
    /// Nodes the store already knows keep their activation status.
    pub async fn seed(&self, store: &(impl NodeStore + ?Sized)) -> Result<(), StoreError> {
        let known = store.nodes().await?;
        for node in &self.nodes {
            let node_id = NodeId(node.node_id.clone());
            let status = known
                .iter()
                .find(|k| k.node_id == node_id)
                .map_or(NodeStatus::Active, |k| k.status);
            store
                .upsert_node(KeyShareNode {
                    node_name: node.node_name.clone().unwrap_or_else(|| node.node_id.clone()),
                    node_id,
                    server_url: node.server_url.trim_end_matches('/').to_string(),
                    status,
                })
                .await?;
        }
        store
            .set_meta(KeyShareNodeMeta {
                sss_threshold: self.custody.threshold,
            })
            .await
    }
}

impl std::str::FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
