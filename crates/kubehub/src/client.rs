//! Kubernetes client seam used by tailers.

use std::pin::Pin;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, LogParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio_util::compat::FuturesAsyncReadCompatExt;
use tracing::debug;

/// Raw bytes of a container log stream.
pub type LogStream = Pin<Box<dyn AsyncRead + Send>>;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogStreamParams {
    pub container: String,
    /// Only return lines at or after this instant.
    pub since_time: Option<DateTime<Utc>>,
    pub follow: bool,
    /// Ask the API server to prefix each line with its RFC3339 timestamp.
    pub timestamps: bool,
}

#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn log_stream(&self, namespace: &str, pod: &str, params: &LogStreamParams) -> Result<LogStream>;
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod>;
}

/// [`KubeClient`] over a real `kube::Client`.
#[derive(Clone)]
pub struct KubeRsClient {
    client: Client,
}

impl KubeRsClient {
    pub fn new(client: Client) -> Self { Self { client } }
    pub fn inner(&self) -> &Client { &self.client }
}

#[async_trait]
impl KubeClient for KubeRsClient {
    async fn log_stream(&self, namespace: &str, pod: &str, params: &LogStreamParams) -> Result<LogStream> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = LogParams {
            container: Some(params.container.clone()),
            follow: params.follow,
            since_time: params.since_time,
            timestamps: params.timestamps,
            ..LogParams::default()
        };
        debug!(ns = %namespace, pod = %pod, container = %params.container, since = ?params.since_time, "opening log stream");
        let reader = api
            .log_stream(pod, &lp)
            .await
            .with_context(|| format!("opening log stream for {}/{}:{}", namespace, pod, params.container))?;
        Ok(Box::pin(reader.compat()))
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.get(name).await.with_context(|| format!("getting pod {}/{}", namespace, name))
    }
}

/// How to reach the Kubernetes API. With neither field set the config is inferred
/// (in-cluster service account, then the default kubeconfig).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientArgs {
    pub api_server: Option<String>,
    pub kubeconfig_file: Option<String>,
}

impl ClientArgs {
    pub fn validate(&self) -> Result<()> {
        if self.api_server.is_some() && self.kubeconfig_file.is_some() {
            return Err(anyhow!("api_server and kubeconfig_file are mutually exclusive"));
        }
        Ok(())
    }

    pub async fn build_client(&self) -> Result<Client> {
        self.validate()?;
        let config = if let Some(path) = &self.kubeconfig_file {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path))?;
            Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .with_context(|| format!("loading kubeconfig {}", path))?
        } else if let Some(server) = &self.api_server {
            Config::new(server.parse().with_context(|| format!("parsing api_server {:?}", server))?)
        } else {
            Config::infer().await.context("inferring kubernetes config")?
        };
        Client::try_from(config).context("building kubernetes client")
    }
}

/// Builds a [`KubeClient`] from [`ClientArgs`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, args: &ClientArgs) -> Result<Arc<dyn KubeClient>>;
}

pub struct KubeRsConnector;

#[async_trait]
impl Connector for KubeRsConnector {
    async fn connect(&self, args: &ClientArgs) -> Result<Arc<dyn KubeClient>> {
        Ok(Arc::new(KubeRsClient::new(args.build_client().await?)))
    }
}
