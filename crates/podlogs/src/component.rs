//! The podlogs component: discovers targets from PodLogs resources and tails them.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use loglane_core::cluster::{Cluster, HashRing};
use loglane_core::{Entry, Fanout, LogsReceiver};
use loglane_kubehub::{ClientArgs, KubeClient, KubeRsClient, Selector};
use loglane_kubetail::{DebugInfoTarget, Manager, Options, TailTuning};
use loglane_persist::{SqlitePositions, DEFAULT_SYNC_PERIOD};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{Controller, Informers, KubeInformers};
use crate::reconciler::{DiscoveredPodLogs, Reconciler};

const HANDLER_CAPACITY: usize = 1024;
pub const DEFAULT_INFORMER_SYNC_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusteringArgs {
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Default)]
pub struct Arguments {
    pub forward_to: Vec<LogsReceiver>,
    pub client: ClientArgs,
    /// Selects PodLogs resources.
    pub selector: LabelSelector,
    /// Selects the namespaces PodLogs resources may live in.
    pub namespace_selector: LabelSelector,
    pub clustering: ClusteringArgs,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PodLogsDebugInfo {
    pub discovered_podlogs: Vec<DiscoveredPodLogs>,
    pub targets: Vec<DebugInfoTarget>,
}

/// Builds the log client and the informer source from one set of client arguments.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn connect(&self, args: &ClientArgs) -> Result<(Arc<dyn KubeClient>, Arc<dyn Informers>)>;
}

pub struct KubeBackend;

#[async_trait]
impl Backend for KubeBackend {
    async fn connect(&self, args: &ClientArgs) -> Result<(Arc<dyn KubeClient>, Arc<dyn Informers>)> {
        let client = args.build_client().await?;
        Ok((Arc::new(KubeRsClient::new(client.clone())), Arc::new(KubeInformers(client))))
    }
}

#[derive(Default)]
struct State {
    client: Option<ClientArgs>,
    selectors: Option<(LabelSelector, LabelSelector)>,
    clustering: bool,
}

pub struct PodLogsComponent {
    backend: Arc<dyn Backend>,
    tuning: TailTuning,
    positions: Arc<SqlitePositions>,
    fanout: Fanout,
    handler: mpsc::Sender<Entry>,
    entries: Mutex<Option<mpsc::Receiver<Entry>>>,
    manager: Arc<Manager>,
    reconciler: Arc<Reconciler>,
    controller: Arc<Controller>,
    ring: Option<Arc<HashRing>>,
    clustering: AtomicBool,
    state: Mutex<State>,
}

impl PodLogsComponent {
    pub async fn new(
        data_path: Option<PathBuf>,
        backend: Arc<dyn Backend>,
        ring: Option<Arc<HashRing>>,
        tuning: TailTuning,
        sync_timeout: Duration,
        args: Arguments,
    ) -> Result<Self> {
        let positions = match data_path {
            Some(dir) => {
                std::fs::create_dir_all(&dir).with_context(|| format!("creating data path {}", dir.display()))?;
                SqlitePositions::open(&dir.join("positions.db").to_string_lossy())?
            }
            None => SqlitePositions::open_in_memory()?,
        };
        let (handler, entries) = mpsc::channel(HANDLER_CAPACITY);
        let manager = Arc::new(Manager::new(None));
        let cluster = ring.clone().map(|r| r as Arc<dyn Cluster>);
        let reconciler = Arc::new(Reconciler::new(manager.clone(), cluster));
        let me = Self {
            backend,
            tuning,
            positions: Arc::new(positions),
            fanout: Fanout::default(),
            handler,
            entries: Mutex::new(Some(entries)),
            manager,
            controller: Arc::new(Controller::new(reconciler.clone(), sync_timeout)),
            reconciler,
            ring,
            clustering: AtomicBool::new(false),
            state: Mutex::new(State::default()),
        };
        me.update(args).await?;
        Ok(me)
    }

    pub async fn update(&self, args: Arguments) -> Result<()> {
        args.client.validate()?;
        // Receivers first so nothing is routed to stale ones if the rest fails.
        self.fanout.set(args.forward_to);

        let mut st = self.state.lock().await;
        if st.client.as_ref() != Some(&args.client) {
            let (client, informers) = self.backend.connect(&args.client).await.context("building Kubernetes client")?;
            let options = Arc::new(Options::new(client, self.handler.clone(), self.positions.clone()).with_tuning(self.tuning));
            self.manager.update_options(&CancellationToken::new(), Some(options)).await?;
            self.controller.reload(informers);
            st.client = Some(args.client.clone());
        }

        let podlogs = Selector::from_label_selector(&args.selector).context("invalid selector")?;
        let namespaces = Selector::from_label_selector(&args.namespace_selector).context("invalid namespace_selector")?;
        self.clustering.store(args.clustering.enabled, Ordering::SeqCst);
        self.reconciler.set_distribute(args.clustering.enabled && self.ring.is_some());

        let selectors = (args.selector, args.namespace_selector);
        if st.selectors.as_ref() != Some(&selectors) || st.clustering != args.clustering.enabled {
            info!(selector = %podlogs, namespace_selector = %namespaces, "podlogs: selectors updated");
            self.reconciler.update_selectors(podlogs, namespaces);
            st.selectors = Some(selectors);
            st.clustering = args.clustering.enabled;
            self.controller.request_reconcile();
        }
        Ok(())
    }

    /// Run until `token` is cancelled, then stop every tailer and flush positions.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut entries = self.entries.lock().await.take().ok_or_else(|| anyhow!("component is already running"))?;
        let sync_token = CancellationToken::new();
        let sync = self.positions.spawn_sync(DEFAULT_SYNC_PERIOD, sync_token.clone());

        let controller_token = token.child_token();
        let controller = self.controller.clone();
        let controller_task = tokio::spawn({
            let t = controller_token.clone();
            async move { controller.run(t).await }
        });

        let mut membership = self.ring.as_ref().map(|r| r.subscribe());
        info!("podlogs: running");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = entries.recv() => match next {
                    Some(e) => { self.fanout.send(e, &token).await; }
                    None => break,
                },
                changed = membership_changed(&mut membership) => {
                    if changed { self.notify_cluster_change(); } else { membership = None; }
                }
            }
        }

        controller_token.cancel();
        let _ = controller_task.await;
        self.manager.stop().await;
        sync_token.cancel();
        let _ = sync.await;
        info!("podlogs: stopped");
        Ok(())
    }

    /// Ownership may have moved; reconcile if targets are distributed.
    pub fn notify_cluster_change(&self) {
        if self.clustering.load(Ordering::SeqCst) {
            self.controller.request_reconcile();
        }
    }

    pub fn debug_info(&self) -> PodLogsDebugInfo {
        PodLogsDebugInfo {
            discovered_podlogs: self.reconciler.debug_info(),
            targets: self.manager.targets().iter().map(|t| t.debug_info()).collect(),
        }
    }

    pub fn positions(&self) -> &Arc<SqlitePositions> { &self.positions }
}

async fn membership_changed(rx: &mut Option<watch::Receiver<u64>>) -> bool {
    match rx {
        Some(rx) => rx.changed().await.is_ok(),
        None => std::future::pending().await,
    }
}
