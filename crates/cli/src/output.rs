//! Stdout receiver: one JSON object per entry.

use std::io::Write;

use loglane_core::{Entry, LogsReceiver};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

const CAPACITY: usize = 1024;

/// Spawn a writer draining its channel to stdout. Ends once every sender is dropped.
pub fn stdout_receiver() -> (LogsReceiver, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Entry>(CAPACITY);
    let handle = tokio::spawn(async move {
        let stdout = std::io::stdout();
        while let Some(entry) = rx.recv().await {
            let mut out = stdout.lock();
            let res = serde_json::to_writer(&mut out, &entry).map_err(std::io::Error::from).and_then(|_| writeln!(out));
            if let Err(e) = res {
                warn!(error = %e, "output: failed to write entry");
                break;
            }
        }
    });
    (tx, handle)
}
