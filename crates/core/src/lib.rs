//! Loglane core types: label sets, log entries, relabeling and the cluster ring.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub mod cluster;
pub mod fanout;
pub mod labels;
pub mod relabel;

pub use fanout::Fanout;
pub use labels::{LabelError, LabelSet};

/// Label prefix reserved for discovery metadata.
pub const META_LABEL_PREFIX: &str = "__meta_";
/// Labels starting with this prefix never leave the agent.
pub const RESERVED_LABEL_PREFIX: &str = "__";
pub const JOB_LABEL: &str = "job";
pub const INSTANCE_LABEL: &str = "instance";

/// A single log line with the labels of the stream it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entry {
    pub labels: LabelSet,
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Receiving end of the entry fan-out. Each downstream owns its channel and backpressure.
pub type LogsReceiver = mpsc::Sender<Entry>;

pub mod prelude {
    pub use super::cluster::{Cluster, HashRing, Op, Peer};
    pub use super::relabel::{RelabelConfig, Rule};
    pub use super::{Entry, Fanout, LabelSet, LogsReceiver};
}
