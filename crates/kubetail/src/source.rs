//! Tailing a fixed list of discovered targets, without PodLogs reconciliation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use loglane_core::{Entry, Fanout, LabelSet, LogsReceiver};
use loglane_kubehub::{ClientArgs, Connector};
use loglane_persist::{SqlitePositions, DEFAULT_SYNC_PERIOD};
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::manager::{Manager, Options};
use crate::target::{prepare_labels, DebugInfoTarget, Target};
use crate::TailTuning;

const HANDLER_CAPACITY: usize = 1024;

#[derive(Clone, Default)]
pub struct SourceArgs {
    /// Discovery label sets; each must carry the `__pod_*__` identity labels.
    pub targets: Vec<LabelSet>,
    pub forward_to: Vec<LogsReceiver>,
    pub client: ClientArgs,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceDebugInfo {
    pub targets: Vec<DebugInfoTarget>,
}

#[derive(Default)]
struct State {
    client: Option<ClientArgs>,
    options: Option<Arc<Options>>,
}

pub struct KubernetesSource {
    id: String,
    connector: Arc<dyn Connector>,
    tuning: TailTuning,
    positions: Arc<SqlitePositions>,
    fanout: Fanout,
    handler: mpsc::Sender<Entry>,
    entries: Mutex<Option<mpsc::Receiver<Entry>>>,
    manager: Manager,
    state: Mutex<State>,
}

impl KubernetesSource {
    /// `id` is the default `job` label. Positions go to `data_path/positions.db`, or stay
    /// in memory when `data_path` is `None`.
    pub async fn new(
        id: impl Into<String>,
        data_path: Option<PathBuf>,
        connector: Arc<dyn Connector>,
        tuning: TailTuning,
        args: SourceArgs,
    ) -> Result<Self> {
        let positions = match data_path {
            Some(dir) => {
                std::fs::create_dir_all(&dir).with_context(|| format!("creating data path {}", dir.display()))?;
                SqlitePositions::open(&dir.join("positions.db").to_string_lossy())?
            }
            None => SqlitePositions::open_in_memory()?,
        };
        let (handler, entries) = mpsc::channel(HANDLER_CAPACITY);
        let me = Self {
            id: id.into(),
            connector,
            tuning,
            positions: Arc::new(positions),
            fanout: Fanout::default(),
            handler,
            entries: Mutex::new(Some(entries)),
            manager: Manager::new(None),
            state: Mutex::new(State::default()),
        };
        me.update(args).await?;
        Ok(me)
    }

    pub async fn update(&self, args: SourceArgs) -> Result<()> {
        // Receivers first so nothing is routed to stale ones if the rest fails.
        self.fanout.set(args.forward_to);

        let never = CancellationToken::new();
        let mut st = self.state.lock().await;
        if st.options.is_none() || st.client.as_ref() != Some(&args.client) {
            let client = self.connector.connect(&args.client).await.context("building Kubernetes client")?;
            let options = Arc::new(
                Options::new(client, self.handler.clone(), self.positions.clone()).with_tuning(self.tuning),
            );
            self.manager.update_options(&never, Some(options.clone())).await?;
            st.options = Some(options);
            st.client = Some(args.client.clone());
        }

        let mut targets = Vec::with_capacity(args.targets.len());
        for lset in args.targets {
            match prepare_labels(&lset, &self.id) {
                Ok(processed) => targets.push(Arc::new(Target::new(lset, processed))),
                Err(e) => error!(target_labels = %lset, error = %e, "failed to process input target"),
            }
        }
        self.manager.sync_targets(&never, targets).await?;
        Ok(())
    }

    /// Forward entries to receivers until `token` is cancelled, then stop every tailer
    /// and flush positions.
    pub async fn run(&self, token: CancellationToken) -> Result<()> {
        let mut entries = self.entries.lock().await.take().ok_or_else(|| anyhow!("source is already running"))?;
        let sync_token = CancellationToken::new();
        let sync = self.positions.spawn_sync(DEFAULT_SYNC_PERIOD, sync_token.clone());
        info!(id = %self.id, "source running");

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                next = entries.recv() => match next {
                    Some(e) => { self.fanout.send(e, &token).await; }
                    None => break,
                },
            }
        }

        self.manager.stop().await;
        sync_token.cancel();
        let _ = sync.await;
        info!(id = %self.id, "source stopped");
        Ok(())
    }

    pub fn debug_info(&self) -> SourceDebugInfo {
        SourceDebugInfo { targets: self.manager.targets().iter().map(|t| t.debug_info()).collect() }
    }

    pub fn positions(&self) -> &Arc<SqlitePositions> { &self.positions }
}
