//! Loglane runner: keeps a pool of long-running workers in sync with a desired task set.
//!
//! Every call to [`Runner::apply_tasks`] diffs the desired tasks against the running
//! workers by [`Task::hash_key`] and then [`Task::same_as`]. Workers whose task is
//! unchanged keep running; removed or changed ones are stopped and awaited before any
//! replacement starts, so at most one worker exists per hash at any time.

#![forbid(unsafe_code)]

use std::sync::Arc;

use arc_swap::ArcSwap;
use metrics::gauge;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Identity of a unit of work.
pub trait Task: Send + Sync + 'static {
    /// Key pairing a desired task with a running worker.
    fn hash_key(&self) -> u64;
    /// True when a worker started for `other` can keep serving `self`.
    fn same_as(&self, other: &Self) -> bool;
}

/// A long-running process started for one task. `run` returns once `token` is
/// cancelled or the worker has nothing left to do; failures are the worker's own
/// business to retry.
#[async_trait::async_trait]
pub trait Worker: Send + 'static {
    async fn run(&mut self, token: CancellationToken);
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("cancelled while waiting for workers to stop")]
    Cancelled,
}

type Factory<T> = Arc<dyn Fn(&Arc<T>) -> Box<dyn Worker> + Send + Sync>;

struct Running<T> {
    task: Arc<T>,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct Runner<T: Task> {
    factory: Factory<T>,
    root: CancellationToken,
    workers: Mutex<FxHashMap<u64, Running<T>>>,
    snapshot: ArcSwap<Vec<Arc<T>>>,
}

impl<T: Task> Runner<T> {
    pub fn new<F, W>(factory: F) -> Self
    where
        F: Fn(&Arc<T>) -> W + Send + Sync + 'static,
        W: Worker,
    {
        Self {
            factory: Arc::new(move |t: &Arc<T>| Box::new(factory(t)) as Box<dyn Worker>),
            root: CancellationToken::new(),
            workers: Mutex::new(FxHashMap::default()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Reconcile running workers against `tasks`. Stopped workers are awaited before
    /// this returns; `token` bounds that wait. An empty list stops everything.
    pub async fn apply_tasks(&self, token: &CancellationToken, tasks: Vec<Arc<T>>) -> Result<(), RunnerError> {
        let mut workers = self.workers.lock().await;

        // First occurrence wins when the desired list repeats a hash.
        let mut seen = FxHashSet::default();
        let desired: Vec<Arc<T>> = tasks.into_iter().filter(|t| seen.insert(t.hash_key())).collect();
        let by_key: FxHashMap<u64, &Arc<T>> = desired.iter().map(|t| (t.hash_key(), t)).collect();

        let stale: Vec<u64> = workers
            .iter()
            .filter(|(key, w)| !matches!(by_key.get(*key), Some(t) if t.same_as(&w.task)))
            .map(|(key, _)| *key)
            .collect();
        let stopping: Vec<Running<T>> = stale.iter().filter_map(|k| workers.remove(k)).collect();
        for w in &stopping { w.token.cancel(); }

        let count = stopping.len();
        let wait_all = async {
            for w in stopping {
                if let Err(e) = w.handle.await {
                    if e.is_panic() { warn!(key = w.task.hash_key(), "worker panicked"); }
                }
            }
        };
        tokio::select! {
            _ = wait_all => {}
            _ = token.cancelled() => {
                self.publish(&workers);
                return Err(RunnerError::Cancelled);
            }
        }

        let mut started = 0usize;
        for task in desired {
            let key = task.hash_key();
            if workers.contains_key(&key) { continue; }
            let child = self.root.child_token();
            let mut worker = (self.factory)(&task);
            let worker_token = child.clone();
            let handle = tokio::spawn(async move { worker.run(worker_token).await });
            workers.insert(key, Running { task, token: child, handle });
            started += 1;
        }

        debug!(stopped = count, started, running = workers.len(), "applied tasks");
        self.publish(&workers);
        Ok(())
    }

    /// Snapshot of the tasks whose workers are currently registered.
    pub fn tasks(&self) -> Vec<Arc<T>> { self.snapshot.load().as_ref().clone() }

    /// Stop every worker and wait for all of them to exit.
    pub async fn stop(&self) {
        self.root.cancel();
        let mut workers = self.workers.lock().await;
        let drained: Vec<Running<T>> = workers.drain().map(|(_, w)| w).collect();
        for w in drained {
            let _ = w.handle.await;
        }
        self.publish(&workers);
    }

    fn publish(&self, workers: &FxHashMap<u64, Running<T>>) {
        let mut tasks: Vec<Arc<T>> = workers.values().map(|w| Arc::clone(&w.task)).collect();
        tasks.sort_by_key(|t| t.hash_key());
        gauge!("loglane_runner_workers", tasks.len() as f64);
        self.snapshot.store(Arc::new(tasks));
    }
}
