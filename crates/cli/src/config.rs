//! YAML configuration of the `podlogs` command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use loglane_core::cluster::{HashRing, Peer};
use loglane_kubehub::ClientArgs;
use loglane_podlogs::component::DEFAULT_INFORMER_SYNC_TIMEOUT;
use serde::Deserialize;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClusteringConfig {
    pub enabled: bool,
    /// Name of this instance among `peers`; defaults to `$HOSTNAME`.
    pub self_name: Option<String>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodLogsConfig {
    pub data_path: Option<PathBuf>,
    pub client: ClientArgs,
    pub selector: LabelSelector,
    pub namespace_selector: LabelSelector,
    pub clustering: ClusteringConfig,
    pub informer_sync_timeout_secs: Option<u64>,
}

impl PodLogsConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(raw)?;
        cfg.client.validate()?;
        Ok(cfg)
    }

    pub fn sync_timeout(&self) -> Duration {
        self.informer_sync_timeout_secs.map(Duration::from_secs).unwrap_or(DEFAULT_INFORMER_SYNC_TIMEOUT)
    }

    /// Static ring over the configured peers, or `None` when clustering is off.
    pub fn ring(&self) -> Option<Arc<HashRing>> {
        let c = &self.clustering;
        if !c.enabled { return None; }
        let me = c.self_name.clone().or_else(|| std::env::var("HOSTNAME").ok()).unwrap_or_else(|| "loglane".to_string());
        if c.peers.is_empty() {
            return Some(Arc::new(HashRing::standalone(&me)));
        }
        let peers = c.peers.iter().cloned().map(|mut p| { p.is_self = p.name == me; p }).collect();
        Some(Arc::new(HashRing::new(peers)))
    }
}
