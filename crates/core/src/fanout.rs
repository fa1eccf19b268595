//! Delivery of entries to a replaceable set of downstream receivers.

use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{Entry, LogsReceiver};

#[derive(Default)]
pub struct Fanout {
    receivers: ArcSwap<Vec<LogsReceiver>>,
}

impl Fanout {
    pub fn new(receivers: Vec<LogsReceiver>) -> Self { Self { receivers: ArcSwap::from_pointee(receivers) } }

    pub fn set(&self, receivers: Vec<LogsReceiver>) { self.receivers.store(Arc::new(receivers)); }

    pub fn len(&self) -> usize { self.receivers.load().len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Send `entry` to every receiver in turn, waiting on each one's backpressure.
    /// Returns false if `token` was cancelled before delivery finished.
    pub async fn send(&self, entry: Entry, token: &CancellationToken) -> bool {
        let receivers = self.receivers.load_full();
        for rx in receivers.iter() {
            tokio::select! {
                _ = token.cancelled() => return false,
                res = rx.send(entry.clone()) => {
                    if res.is_err() { debug!("fanout: receiver closed; skipping"); }
                }
            }
        }
        true
    }
}
