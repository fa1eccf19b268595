//! Keeps one tailer running per target.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use loglane_core::Entry;
use loglane_kubehub::KubeClient;
use loglane_persist::Positions;
use loglane_runner::{Runner, RunnerError};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::tailer::{Tailer, TailerTask};
use crate::target::{entry_for_target, Target};
use crate::TailTuning;

static NEXT_VERSION: AtomicU64 = AtomicU64::new(1);

/// Collaborators shared by every tailer of a manager. Never mutated: a change means a
/// new `Options` with a new version, and every tailer built on the old one is replaced.
pub struct Options {
    pub client: Arc<dyn KubeClient>,
    pub handler: mpsc::Sender<Entry>,
    pub positions: Arc<dyn Positions>,
    pub tuning: TailTuning,
    version: u64,
}

impl Options {
    pub fn new(client: Arc<dyn KubeClient>, handler: mpsc::Sender<Entry>, positions: Arc<dyn Positions>) -> Self {
        Self { client, handler, positions, tuning: TailTuning::default(), version: NEXT_VERSION.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn with_tuning(mut self, tuning: TailTuning) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn version(&self) -> u64 { self.version }
}

#[derive(Default)]
struct State {
    options: Option<Arc<Options>>,
    targets: Vec<Arc<Target>>,
}

pub struct Manager {
    runner: Runner<TailerTask>,
    state: Mutex<State>,
}

impl Manager {
    pub fn new(options: Option<Arc<Options>>) -> Self {
        Self {
            runner: Runner::new(Tailer::new),
            state: Mutex::new(State { options, targets: Vec::new() }),
        }
    }

    /// Run exactly one tailer per target. Positions of targets that went away are
    /// removed once their tailers have exited.
    pub async fn sync_targets(&self, token: &CancellationToken, targets: Vec<Arc<Target>>) -> Result<(), RunnerError> {
        let mut st = self.state.lock().await;
        st.targets = targets;
        let Some(options) = st.options.clone() else {
            return self.runner.apply_tasks(token, Vec::new()).await;
        };

        let previous = self.runner.tasks();
        self.runner.apply_tasks(token, tasks_for(&options, &st.targets)).await?;

        let keep: HashSet<_> = st.targets.iter().map(|t| entry_for_target(t)).collect();
        let mut removed = 0usize;
        for task in previous {
            let ent = entry_for_target(&task.target);
            if !keep.contains(&ent) {
                options.positions.remove(&ent.path, &ent.labels);
                removed += 1;
            }
        }
        debug!(targets = st.targets.len(), positions_removed = removed, "synced targets");
        Ok(())
    }

    /// Swap the shared options, restarting every tailer. `None` stops all tailers but
    /// keeps their positions, so they resume once options return.
    pub async fn update_options(&self, token: &CancellationToken, options: Option<Arc<Options>>) -> Result<(), RunnerError> {
        let mut st = self.state.lock().await;
        st.options = options;
        let tasks = match &st.options {
            Some(o) => tasks_for(o, &st.targets),
            None => Vec::new(),
        };
        self.runner.apply_tasks(token, tasks).await
    }

    /// Targets that currently have a tailer.
    pub fn targets(&self) -> Vec<Arc<Target>> { self.runner.tasks().iter().map(|t| t.target.clone()).collect() }

    pub async fn stop(&self) { self.runner.stop().await; }
}

fn tasks_for(options: &Arc<Options>, targets: &[Arc<Target>]) -> Vec<Arc<TailerTask>> {
    targets.iter().map(|t| Arc::new(TailerTask { options: options.clone(), target: t.clone() })).collect()
}
