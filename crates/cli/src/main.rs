//! loglanectl: tails Kubernetes pod logs and prints them as JSON lines.

#![forbid(unsafe_code)]

mod config;
mod output;
mod tail;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use loglane_kubehub::{ClientArgs, KubeRsConnector};
use loglane_kubetail::{KubernetesSource, SourceArgs, TailTuning};
use loglane_podlogs::{Arguments, ClusteringArgs, KubeBackend, PodLogsComponent};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::PodLogsConfig;

#[derive(Parser, Debug)]
#[command(name = "loglanectl", version, about = "Tail Kubernetes pod logs")]
struct Cli {
    /// Kubeconfig file (default: in-cluster, then ~/.kube/config)
    #[arg(long, global = true, env = "LOGLANE_KUBECONFIG")]
    kubeconfig: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tail containers selected by PodLogs resources
    Podlogs {
        /// YAML configuration file
        #[arg(long, short = 'c', env = "LOGLANE_CONFIG")]
        config: PathBuf,
        /// How often to log a status summary
        #[arg(long = "status-interval-secs", default_value_t = 60)]
        status_interval_secs: u64,
    },
    /// Tail every container of pods matching a label selector
    Tail {
        /// Namespace (default: all namespaces)
        #[arg(long = "ns")]
        namespace: Option<String>,
        /// Label selector, e.g. "app=web,tier!=cache"
        #[arg(long, short = 'l')]
        selector: Option<String>,
        /// Seconds between pod listings
        #[arg(long = "refresh-secs", default_value_t = 30)]
        refresh_secs: u64,
        /// Directory for the positions database (default: in memory)
        #[arg(long = "data-path", env = "LOGLANE_DATA_PATH")]
        data_path: Option<PathBuf>,
    },
}

fn init_tracing() {
    let env = std::env::var("LOGLANE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("LOGLANE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid LOGLANE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Cancelled on Ctrl-C.
fn shutdown_token() -> CancellationToken {
    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
            return;
        }
        info!("shutting down");
        t.cancel();
    });
    token
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Podlogs { config, status_interval_secs } => {
            let mut cfg = PodLogsConfig::load(&config)?;
            if cfg.client.kubeconfig_file.is_none() && cfg.client.api_server.is_none() {
                cfg.client.kubeconfig_file = cli.kubeconfig;
            }
            run_podlogs(cfg, Duration::from_secs(status_interval_secs.max(1))).await
        }
        Commands::Tail { namespace, selector, refresh_secs, data_path } => {
            let client = ClientArgs { api_server: None, kubeconfig_file: cli.kubeconfig };
            run_tail(client, namespace, selector, Duration::from_secs(refresh_secs.max(1)), data_path).await
        }
    }
}

async fn run_podlogs(cfg: PodLogsConfig, status_every: Duration) -> Result<()> {
    let (receiver, writer) = output::stdout_receiver();
    let args = Arguments {
        forward_to: vec![receiver],
        client: cfg.client.clone(),
        selector: cfg.selector.clone(),
        namespace_selector: cfg.namespace_selector.clone(),
        clustering: ClusteringArgs { enabled: cfg.clustering.enabled },
    };
    let component = Arc::new(
        PodLogsComponent::new(cfg.data_path.clone(), Arc::new(KubeBackend), cfg.ring(), TailTuning::default(), cfg.sync_timeout(), args)
            .await?,
    );

    let token = shutdown_token();
    let status = tokio::spawn({
        let (c, t) = (component.clone(), token.clone());
        async move {
            let mut tick = tokio::time::interval(status_every);
            loop {
                tokio::select! {
                    _ = t.cancelled() => break,
                    _ = tick.tick() => {
                        let info = c.debug_info();
                        let failing = info.discovered_podlogs.iter().filter(|p| p.reconcile_error.is_some()).count();
                        info!(podlogs = info.discovered_podlogs.len(), failing, targets = info.targets.len(), "status");
                    }
                }
            }
        }
    });

    component.run(token).await?;
    let _ = status.await;
    drop(component);
    let _ = writer.await;
    Ok(())
}

async fn run_tail(
    client_args: ClientArgs,
    namespace: Option<String>,
    selector: Option<String>,
    refresh: Duration,
    data_path: Option<PathBuf>,
) -> Result<()> {
    let kube_client = client_args.build_client().await?;
    let (receiver, writer) = output::stdout_receiver();
    let base = SourceArgs { targets: Vec::new(), forward_to: vec![receiver], client: client_args };
    let source = Arc::new(KubernetesSource::new("loglane/tail", data_path, Arc::new(KubeRsConnector), TailTuning::default(), base.clone()).await?);

    let token = shutdown_token();
    let run = tokio::spawn({
        let (s, t) = (source.clone(), token.clone());
        async move { s.run(t).await }
    });

    let mut tick = tokio::time::interval(refresh);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = tick.tick() => {
                match tail::list_pods(kube_client.clone(), namespace.as_deref(), selector.as_deref()).await {
                    Ok(pods) => {
                        let targets = tail::targets_for(&pods);
                        info!(pods = pods.len(), targets = targets.len(), "tail: refreshed targets");
                        if let Err(e) = source.update(SourceArgs { targets, ..base.clone() }).await {
                            error!(error = %e, "tail: failed to update targets");
                        }
                    }
                    Err(e) => warn!(error = %format!("{e:#}"), "tail: keeping previous targets"),
                }
            }
        }
    }

    run.await??;
    drop(source);
    drop(base);
    let _ = writer.await;
    Ok(())
}
