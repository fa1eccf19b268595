//! Per-target worker streaming one container's logs.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use loglane_core::Entry;
use loglane_kubehub::LogStreamParams;
use loglane_runner::{Task, Worker};
use metrics::counter;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::Backoff;
use crate::manager::Options;
use crate::parse::parse_kubernetes_log;
use crate::rolling::RollingAverageCalculator;
use crate::target::{entry_for_target, Target};
use crate::termination::container_terminated;
use crate::TailTuning;

/// Runner task pairing shared options with a target.
pub struct TailerTask {
    pub options: Arc<Options>,
    pub target: Arc<Target>,
}

impl Task for TailerTask {
    fn hash_key(&self) -> u64 { self.target.hash() }

    fn same_as(&self, other: &Self) -> bool {
        self.options.version() == other.options.version()
            && self.target.uid() == other.target.uid()
            && self.target.labels() == other.target.labels()
    }
}

pub struct Tailer {
    options: Arc<Options>,
    target: Arc<Target>,
}

impl Tailer {
    pub fn new(task: &Arc<TailerTask>) -> Self { Self { options: task.options.clone(), target: task.target.clone() } }

    /// One connection: open the stream and forward lines until it ends, stalls, ages
    /// out or `token` is cancelled. Ok(()) means the stream ended without an error.
    async fn tail(&self, token: &CancellationToken, bo: &mut Backoff) -> Result<()> {
        let opts = &self.options;
        let target = &self.target;
        let pos = entry_for_target(target);

        let mut last_read: Option<DateTime<Utc>> = match opts.positions.get(&pos.path, &pos.labels) {
            Ok(0) => None,
            Ok(micros) => Utc.timestamp_micros(micros).single(),
            Err(e) => {
                warn!(tailer = %target, error = %e, "failed to load last read offset");
                None
            }
        };
        if let Some(seen) = target.last_entry() {
            if last_read.map_or(true, |lr| seen > lr) {
                last_read = Some(seen);
            }
        }

        let conn = token.child_token();
        let _conn_guard = conn.clone().drop_guard();
        let params = LogStreamParams {
            container: target.container_name().to_string(),
            since_time: last_read,
            follow: true,
            timestamps: true,
        };
        let stream = tokio::select! {
            _ = conn.cancelled() => return Ok(()),
            s = opts.client.log_stream(target.namespace(), target.pod_name(), &params) => s?,
        };

        let calc = Arc::new(RollingAverageCalculator::new(
            opts.tuning.window,
            opts.tuning.min_samples,
            opts.tuning.min_average,
            opts.tuning.default_average,
        ));
        spawn_rotation_watch(conn.clone(), calc.clone(), opts.tuning, target.to_string());

        info!(tailer = %target, start = ?last_read, "opened log stream");

        let mut reader = BufReader::new(stream);
        let mut buf = Vec::with_capacity(512);
        loop {
            buf.clear();
            let read = tokio::select! {
                _ = conn.cancelled() => return Ok(()),
                r = reader.read_until(b'\n', &mut buf) => r,
            };
            match read {
                Ok(0) => return Ok(()),
                Ok(_) => {}
                Err(_) if conn.is_cancelled() => return Ok(()),
                Err(e) => return Err(e.into()),
            }
            calc.add_timestamp(Instant::now());

            let (ts, line) = parse_kubernetes_log(&String::from_utf8_lossy(&buf));
            if last_read.is_some_and(|lr| ts <= lr) {
                continue;
            }
            last_read = Some(ts);

            let entry = Entry { labels: target.labels().clone(), timestamp: ts, line };
            tokio::select! {
                _ = conn.cancelled() => return Ok(()),
                sent = opts.handler.send(entry) => {
                    if sent.is_err() { return Err(anyhow!("entry handler closed")); }
                }
            }
            bo.reset();
            opts.positions.put(&pos.path, &pos.labels, ts.timestamp_micros());
            target.report(ts, None);
            counter!("loglane_entries_total", 1u64);
        }
    }

    async fn terminated(&self, token: &CancellationToken) -> Result<bool> {
        let pod = tokio::select! {
            _ = token.cancelled() => return Ok(false),
            p = self.options.client.get_pod(self.target.namespace(), self.target.pod_name()) => p?,
        };
        container_terminated(&pod, &self.target)
    }
}

#[async_trait::async_trait]
impl Worker for Tailer {
    async fn run(&mut self, token: CancellationToken) {
        info!(tailer = %self.target, "tailer running");
        let tuning = self.options.tuning;
        let mut bo = Backoff::new(tuning.backoff_min, tuning.backoff_max);

        while !token.is_cancelled() {
            let failure = match self.tail(&token, &mut bo).await {
                Ok(()) if token.is_cancelled() => break,
                Ok(()) => match self.terminated(&token).await {
                    Ok(true) => {
                        info!(tailer = %self.target, "container terminated and will not restart");
                        break;
                    }
                    Ok(false) => None,
                    Err(e) => {
                        warn!(tailer = %self.target, error = %format!("{e:#}"), "could not determine if container terminated; will retry tailing");
                        None
                    }
                },
                Err(e) => Some(e),
            };
            if let Some(e) = failure {
                let msg = format!("{e:#}");
                self.target.report(Utc::now(), Some(msg.clone()));
                warn!(tailer = %self.target, error = %msg, "tailer stopped; will retry");
            }
            counter!("loglane_tailer_restarts_total", 1u64);
            if !bo.wait(&token).await {
                break;
            }
            debug!(tailer = %self.target, retries = bo.retries(), "reopening log stream");
        }
        info!(tailer = %self.target, "tailer exited");
    }
}

/// Cancels `conn` once the stream outlives its maximum lifetime or has gone quiet for
/// longer than `stall_factor` average gaps. Some kubelets stop sending lines after a
/// log rotation without closing the stream; reopening recovers them.
fn spawn_rotation_watch(conn: CancellationToken, calc: Arc<RollingAverageCalculator>, tuning: TailTuning, tailer: String) {
    tokio::spawn(async move {
        let lifetime = tokio::time::sleep(tuning.max_connection_lifetime);
        tokio::pin!(lifetime);
        let mut tick = tokio::time::interval(tuning.stall_check_interval);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = conn.cancelled() => return,
                _ = &mut lifetime => {
                    debug!(tailer = %tailer, "log stream reached max lifetime; reopening");
                    conn.cancel();
                    return;
                }
                _ = tick.tick() => {
                    if let Some((avg, since)) = calc.stalled(Instant::now(), tuning.stall_factor) {
                        info!(
                            tailer = %tailer,
                            rolling_average_ms = avg.as_millis() as u64,
                            time_since_last_ms = since.as_millis() as u64,
                            "no log line within the expected gap; closing and reopening stream"
                        );
                        conn.cancel();
                        return;
                    }
                }
            }
        }
    });
}
