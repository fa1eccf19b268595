//! Reflector-backed caches of the objects the reconciler reads.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::PodLogs;
use crate::selector::Selector;

/// Invoked on every add, update or delete seen by any informer.
pub type ChangeFn = Arc<dyn Fn() + Send + Sync>;

/// Read access to the cluster state the reconciler needs.
pub trait ClusterView: Send + Sync {
    fn list_pod_logs(&self, selector: &Selector) -> Result<Vec<Arc<PodLogs>>>;
    fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>>;
    fn list_pods(&self, selector: &Selector) -> Result<Vec<Arc<Pod>>>;
}

/// Namespace, Pod and PodLogs caches sharing one cancellation token.
pub struct InformerSet {
    namespaces: Store<Namespace>,
    pods: Store<Pod>,
    podlogs: Store<PodLogs>,
    token: CancellationToken,
}

impl InformerSet {
    /// Start all informers and wait up to `sync_timeout` for their initial lists.
    pub async fn start(client: Client, on_change: ChangeFn, sync_timeout: Duration) -> Result<Self> {
        let started = Instant::now();
        let token = CancellationToken::new();
        // Stops the reflectors unless the caches sync in time.
        let guard = token.clone().drop_guard();
        let (namespaces, ns_ready) = spawn_reflector(Api::<Namespace>::all(client.clone()), token.clone(), on_change.clone());
        let (pods, pod_ready) = spawn_reflector(Api::<Pod>::all(client.clone()), token.clone(), on_change.clone());
        let (podlogs, pl_ready) = spawn_reflector(Api::<PodLogs>::all(client), token.clone(), on_change);

        let synced = tokio::time::timeout(sync_timeout, futures::future::join_all([ns_ready, pod_ready, pl_ready])).await;
        match synced {
            Ok(results) if results.iter().all(|r| r.is_ok()) => {}
            Ok(_) => bail!("informer stopped before its cache synced"),
            Err(_) => {
                return Err(anyhow!(
                    "timed out waiting for informer caches to sync; check connectivity to the Kubernetes API and RBAC permissions"
                ))
            }
        }
        let token = guard.disarm();
        info!(took_ms = started.elapsed().as_millis() as u64, "informers: caches synced");
        Ok(Self { namespaces, pods, podlogs, token })
    }

    pub fn stop(&self) { self.token.cancel(); }
}

impl Drop for InformerSet {
    fn drop(&mut self) { self.token.cancel(); }
}

impl ClusterView for InformerSet {
    fn list_pod_logs(&self, selector: &Selector) -> Result<Vec<Arc<PodLogs>>> {
        Ok(self.podlogs.state().into_iter().filter(|p| selector.matches_opt(p.metadata.labels.as_ref())).collect())
    }

    fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        self.namespaces.get(&ObjectRef::new(name)).ok_or_else(|| anyhow!("namespace {:?} not found", name))
    }

    fn list_pods(&self, selector: &Selector) -> Result<Vec<Arc<Pod>>> {
        Ok(self.pods.state().into_iter().filter(|p| selector.matches_opt(p.metadata.labels.as_ref())).collect())
    }
}

fn spawn_reflector<K>(api: Api<K>, token: CancellationToken, on_change: ChangeFn) -> (Store<K>, oneshot::Receiver<()>)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    let kind = K::kind(&K::DynamicType::default()).to_string();
    let (reader, writer) = reflector::store();
    let stream = reflector::reflector(writer, watcher(api, watcher::Config::default())).default_backoff();
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let mut stream = Box::pin(stream);
        let mut ready = Some(tx);
        loop {
            let next = tokio::select! {
                _ = token.cancelled() => break,
                n = stream.try_next() => n,
            };
            match next {
                Ok(Some(_)) => {
                    if let Some(tx) = ready.take() {
                        let _ = tx.send(());
                        debug!(kind = %kind, "informer: initial list done");
                    }
                    on_change();
                }
                Ok(None) => {
                    warn!(kind = %kind, "informer: watch stream ended");
                    break;
                }
                Err(e) => warn!(kind = %kind, error = %e, "informer: watch error; retrying"),
            }
        }
        debug!(kind = %kind, "informer: stopped");
    });
    (reader, rx)
}
