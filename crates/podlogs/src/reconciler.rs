//! Builds the target list from the cached cluster state and hands it to the tailers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Container, Pod};
use loglane_core::cluster::{string_key, Cluster, Op};
use loglane_core::relabel::{self, Rule};
use loglane_core::LabelSet;
use loglane_kubehub::{ClusterView, PodLogs, Selector};
use loglane_kubetail::{prepare_labels, Manager, Target};
use metrics::{counter, histogram};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::discovery::{build_target_labels, DiscoveredContainerRef};

/// Outcome of reconciling one PodLogs resource.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPodLogs {
    pub namespace: String,
    pub name: String,
    pub last_reconcile: DateTime<Utc>,
    pub reconcile_error: Option<String>,
    pub pods: Vec<DiscoveredPod>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredPod {
    pub namespace: String,
    pub name: String,
    pub reconcile_error: Option<String>,
    pub containers: Vec<DiscoveredContainer>,
}

/// `labels` is empty when relabeling dropped the container.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredContainer {
    pub discovered_labels: LabelSet,
    pub labels: LabelSet,
    pub reconcile_error: Option<String>,
}

struct Selectors {
    podlogs: Selector,
    namespaces: Selector,
}

pub struct Reconciler {
    manager: Arc<Manager>,
    cluster: Option<Arc<dyn Cluster>>,
    selectors: RwLock<Selectors>,
    distribute: AtomicBool,
    debug: RwLock<Vec<DiscoveredPodLogs>>,
}

impl Reconciler {
    pub fn new(manager: Arc<Manager>, cluster: Option<Arc<dyn Cluster>>) -> Self {
        Self {
            manager,
            cluster,
            selectors: RwLock::new(Selectors { podlogs: Selector::everything(), namespaces: Selector::everything() }),
            distribute: AtomicBool::new(false),
            debug: RwLock::new(Vec::new()),
        }
    }

    /// Selectors applied to PodLogs resources and to the namespaces they live in.
    pub fn update_selectors(&self, podlogs: Selector, namespaces: Selector) {
        let mut s = self.selectors.write().unwrap_or_else(|e| e.into_inner());
        *s = Selectors { podlogs, namespaces };
    }

    pub fn set_distribute(&self, distribute: bool) { self.distribute.store(distribute, Ordering::SeqCst); }

    pub fn debug_info(&self) -> Vec<DiscoveredPodLogs> { self.debug.read().unwrap_or_else(|e| e.into_inner()).clone() }

    pub fn manager(&self) -> &Arc<Manager> { &self.manager }

    /// Rebuild targets from `view` and sync the tailers. Only a failure to list
    /// PodLogs is returned; everything narrower is recorded in the debug snapshot.
    pub async fn reconcile(&self, view: &dyn ClusterView, token: &CancellationToken) -> Result<()> {
        let started = Instant::now();
        debug!("reconciler: reconciling PodLogs");
        let (mut targets, discovered) = self.build_targets(view)?;

        if self.distribute.load(Ordering::SeqCst) {
            if let Some(cluster) = &self.cluster {
                let total = targets.len();
                targets = distribute_targets(cluster.as_ref(), targets);
                debug!(total, owned = targets.len(), "reconciler: distributed targets");
            }
        }

        let count = targets.len();
        if let Err(e) = self.manager.sync_targets(token, targets).await {
            error!(error = %e, "reconciler: failed to apply new tailers to run");
        }
        *self.debug.write().unwrap_or_else(|e| e.into_inner()) = discovered;

        counter!("loglane_reconcile_total", 1u64);
        histogram!("loglane_reconcile_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(targets = count, took_ms = started.elapsed().as_millis() as u64, "reconciler: reconciled");
        Ok(())
    }

    /// Targets for every container selected by a matching PodLogs, before distribution.
    pub fn build_targets(&self, view: &dyn ClusterView) -> Result<(Vec<Arc<Target>>, Vec<DiscoveredPodLogs>)> {
        let (podlogs_sel, ns_sel) = {
            let s = self.selectors.read().unwrap_or_else(|e| e.into_inner());
            (s.podlogs.clone(), s.namespaces.clone())
        };
        let mut podlogs = view.list_pod_logs(&podlogs_sel).context("could not list PodLogs")?;
        podlogs.sort_by(|a, b| {
            (a.metadata.namespace.as_deref(), a.metadata.name.as_deref())
                .cmp(&(b.metadata.namespace.as_deref(), b.metadata.name.as_deref()))
        });

        let mut targets = Vec::new();
        let mut discovered = Vec::new();
        for pl in &podlogs {
            let ns_name = pl.metadata.namespace.as_deref().unwrap_or_default();
            let namespace = match view.get_namespace(ns_name) {
                Ok(ns) => ns,
                Err(e) => {
                    error!(namespace = ns_name, error = %e, "reconciler: failed to reconcile PodLogs");
                    discovered.push(DiscoveredPodLogs {
                        namespace: ns_name.to_string(),
                        name: pl.metadata.name.clone().unwrap_or_default(),
                        last_reconcile: Utc::now(),
                        reconcile_error: Some(format!("failed to get namespace: {e:#}")),
                        pods: Vec::new(),
                    });
                    continue;
                }
            };
            if !ns_sel.matches_opt(namespace.metadata.labels.as_ref()) {
                continue;
            }
            discovered.push(self.reconcile_pod_logs(view, pl, &mut targets));
        }
        Ok((targets, discovered))
    }

    fn reconcile_pod_logs(&self, view: &dyn ClusterView, pl: &PodLogs, targets: &mut Vec<Arc<Target>>) -> DiscoveredPodLogs {
        let namespace = pl.metadata.namespace.clone().unwrap_or_default();
        let name = pl.metadata.name.clone().unwrap_or_default();
        let mut out = DiscoveredPodLogs {
            namespace: namespace.clone(),
            name: name.clone(),
            last_reconcile: Utc::now(),
            reconcile_error: None,
            pods: Vec::new(),
        };

        let prepared = (|| -> Result<(Vec<Rule>, Selector, Selector)> {
            let rules = relabel::compile_all(&pl.spec.relabelings).context("invalid relabelings")?;
            let pods = Selector::from_label_selector(&pl.spec.selector).context("invalid Pod selector")?;
            let namespaces =
                Selector::from_label_selector(&pl.spec.namespace_selector).context("invalid Pod namespaceSelector")?;
            Ok((rules, pods, namespaces))
        })();
        let (rules, pod_sel, ns_sel) = match prepared {
            Ok(p) => p,
            Err(e) => {
                warn!(podlogs = %format!("{namespace}/{name}"), error = %format!("{e:#}"), "reconciler: skipping PodLogs");
                out.reconcile_error = Some(format!("{e:#}"));
                return out;
            }
        };

        let mut pods = match view.list_pods(&pod_sel) {
            Ok(p) => p,
            Err(e) => {
                out.reconcile_error = Some(format!("failed to list Pods: {e:#}"));
                return out;
            }
        };
        pods.sort_by(|a, b| {
            (a.metadata.namespace.as_deref(), a.metadata.name.as_deref())
                .cmp(&(b.metadata.namespace.as_deref(), b.metadata.name.as_deref()))
        });

        let default_job = format!("{namespace}/{name}");
        for pod in &pods {
            let pod_ns = pod.metadata.namespace.as_deref().unwrap_or_default();
            let mut dp = DiscoveredPod {
                namespace: pod_ns.to_string(),
                name: pod.metadata.name.clone().unwrap_or_default(),
                reconcile_error: None,
                containers: Vec::new(),
            };
            let ns = match view.get_namespace(pod_ns) {
                Ok(ns) => ns,
                Err(e) => {
                    dp.reconcile_error = Some(format!("failed to get namespace: {e:#}"));
                    out.pods.push(dp);
                    continue;
                }
            };
            if !ns_sel.matches_opt(ns.metadata.labels.as_ref()) {
                continue;
            }

            for (container, init) in containers(pod) {
                let discovered = build_target_labels(&DiscoveredContainerRef { podlogs: pl, namespace: &ns, pod, container, init });
                let mut dc = DiscoveredContainer {
                    discovered_labels: discovered.clone(),
                    labels: LabelSet::new(),
                    reconcile_error: None,
                };
                if let Some(processed) = relabel::process(&discovered, &rules) {
                    match prepare_labels(&processed, &format!("{default_job}:{}", container.name)) {
                        Ok(finalized) => {
                            dc.labels = finalized.without_internal();
                            targets.push(Arc::new(Target::new(discovered, finalized)));
                        }
                        Err(e) => dc.reconcile_error = Some(format!("invalid labels: {e}")),
                    }
                }
                dp.containers.push(dc);
            }
            out.pods.push(dp);
        }
        out
    }
}

/// Init containers first, then regular containers.
fn containers(pod: &Pod) -> impl Iterator<Item = (&Container, bool)> {
    let spec = pod.spec.as_ref();
    let init = spec.and_then(|s| s.init_containers.as_ref()).into_iter().flatten().map(|c| (c, true));
    let app = spec.into_iter().flat_map(|s| s.containers.iter()).map(|c| (c, false));
    init.chain(app)
}

/// Keep the targets this instance owns. Lookup failures keep the target so logs are
/// collected more than once rather than not at all.
pub fn distribute_targets(cluster: &dyn Cluster, targets: Vec<Arc<Target>>) -> Vec<Arc<Target>> {
    targets
        .into_iter()
        .filter(|t| match cluster.lookup(string_key(&t.labels().to_string()), 1, Op::ReadWrite) {
            Ok(peers) => peers.first().map_or(true, |p| p.is_self),
            Err(e) => {
                warn!(target = %t, error = %e, "reconciler: ownership lookup failed, keeping target");
                true
            }
        })
        .collect()
}
