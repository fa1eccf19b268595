//! Drives reconciliation from informer events and client reloads.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use loglane_kubehub::{ChangeFn, ClusterView, InformerSet};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::reconciler::Reconciler;

/// Starts a set of synced caches for the reconciler to read from.
#[async_trait]
pub trait Informers: Send + Sync {
    async fn start(&self, on_change: ChangeFn, sync_timeout: Duration) -> Result<Arc<dyn ClusterView>>;
}

pub struct KubeInformers(pub kube::Client);

#[async_trait]
impl Informers for KubeInformers {
    async fn start(&self, on_change: ChangeFn, sync_timeout: Duration) -> Result<Arc<dyn ClusterView>> {
        let set = InformerSet::start(self.0.clone(), on_change, sync_timeout).await?;
        Ok(Arc::new(set))
    }
}

type Source = Option<Arc<dyn Informers>>;

pub struct Controller {
    reconciler: Arc<Reconciler>,
    sync_timeout: Duration,
    reconcile_tx: mpsc::Sender<()>,
    reconcile_rx: Mutex<Option<mpsc::Receiver<()>>>,
    reload: watch::Sender<Source>,
    reload_error: std::sync::Mutex<Option<String>>,
}

impl Controller {
    pub fn new(reconciler: Arc<Reconciler>, sync_timeout: Duration) -> Self {
        let (reconcile_tx, reconcile_rx) = mpsc::channel(1);
        let (reload, _) = watch::channel(None);
        Self {
            reconciler,
            sync_timeout,
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            reload,
            reload_error: std::sync::Mutex::new(None),
        }
    }

    /// Queue a reconcile. Returns false when one is already pending.
    pub fn request_reconcile(&self) -> bool { self.reconcile_tx.try_send(()).is_ok() }

    /// Switch to caches built by `source`. The current caches keep serving until the
    /// new ones have synced.
    pub fn reload(&self, source: Arc<dyn Informers>) { self.reload.send_replace(Some(source)); }

    pub fn reconciler(&self) -> &Arc<Reconciler> { &self.reconciler }

    /// Error of the most recent informer start, cleared once a start succeeds.
    pub fn reload_error(&self) -> Option<String> { self.reload_error.lock().unwrap_or_else(|e| e.into_inner()).clone() }

    pub async fn run(&self, token: CancellationToken) {
        let Some(mut requests) = self.reconcile_rx.lock().await.take() else {
            error!("controller: already running");
            return;
        };
        let mut reloads = self.reload.subscribe();
        reloads.mark_changed();
        let mut view: Option<Arc<dyn ClusterView>> = None;
        let mut starting: Option<Starting> = None;
        info!("controller: running");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                changed = reloads.changed() => {
                    if changed.is_err() { break; }
                    let source = reloads.borrow_and_update().clone();
                    let Some(source) = source else { continue };
                    if let Some(prev) = starting.take() { prev.abort(); }
                    let tx = self.reconcile_tx.clone();
                    let on_change: ChangeFn = Arc::new(move || { let _ = tx.try_send(()); });
                    let sync_timeout = self.sync_timeout;
                    starting = Some(tokio::spawn(async move {
                        match tokio::time::timeout(sync_timeout, source.start(on_change, sync_timeout)).await {
                            Ok(started) => started,
                            Err(_) => Err(anyhow!("timed out after {sync_timeout:?} waiting for informer caches to sync")),
                        }
                    }));
                }
                started = informers_started(&mut starting) => {
                    starting = None;
                    match started {
                        Ok(v) => {
                            // Dropping the previous view stops its informers.
                            view = Some(v);
                            self.set_reload_error(None);
                            info!("controller: informers started");
                            self.request_reconcile();
                        }
                        Err(e) => {
                            error!(error = %format!("{e:#}"), "controller: failed to start informers, keeping previous caches");
                            self.set_reload_error(Some(format!("{e:#}")));
                        }
                    }
                }
                Some(()) = requests.recv() => {
                    let Some(v) = view.as_ref() else { continue };
                    if let Err(e) = self.reconciler.reconcile(v.as_ref(), &token).await {
                        error!(error = %format!("{e:#}"), "controller: reconcile failed");
                    }
                }
            }
        }
        if let Some(pending) = starting { pending.abort(); }
        *self.reconcile_rx.lock().await = Some(requests);
        info!("controller: stopped");
    }

    fn set_reload_error(&self, err: Option<String>) {
        *self.reload_error.lock().unwrap_or_else(|e| e.into_inner()) = err;
    }
}

type Starting = JoinHandle<Result<Arc<dyn ClusterView>>>;

async fn informers_started(starting: &mut Option<Starting>) -> Result<Arc<dyn ClusterView>> {
    match starting {
        Some(handle) => handle.await.map_err(|e| anyhow!("informer start task failed: {e}"))?,
        None => std::future::pending().await,
    }
}
