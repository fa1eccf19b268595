//! Loglane kubetail: streams container logs from the Kubernetes API.
//!
//! A [`Manager`] owns one [`Tailer`](tailer::Tailer) per [`Target`]; tailers retry
//! forever with backoff, resume from the positions store and reopen streams that
//! look stalled.

#![forbid(unsafe_code)]

use std::time::Duration;

pub mod backoff;
pub mod manager;
pub mod parse;
pub mod rolling;
pub mod source;
pub mod tailer;
pub mod target;
pub mod termination;

pub use manager::{Manager, Options};
pub use source::{KubernetesSource, SourceArgs, SourceDebugInfo};
pub use target::{prepare_labels, DebugInfoTarget, Target};

pub const LABEL_POD_NAMESPACE: &str = "__pod_namespace__";
pub const LABEL_POD_NAME: &str = "__pod_name__";
pub const LABEL_POD_CONTAINER_NAME: &str = "__pod_container_name__";
pub const LABEL_POD_UID: &str = "__pod_uid__";

/// Timing knobs for tailers. The defaults are empirically chosen; change them only
/// with evidence from real clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailTuning {
    /// Inter-line gaps kept for the rolling average.
    pub window: usize,
    /// Below this many samples the average is `default_average`.
    pub min_samples: usize,
    pub min_average: Duration,
    pub default_average: Duration,
    /// Streams are reopened at least this often.
    pub max_connection_lifetime: Duration,
    /// A stream is reopened when no line arrived for `stall_factor` times the average gap.
    pub stall_factor: u32,
    pub stall_check_interval: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
}

impl Default for TailTuning {
    fn default() -> Self {
        Self {
            window: 10_000,
            min_samples: 100,
            min_average: Duration::from_secs(2),
            default_average: Duration::from_secs(3600),
            max_connection_lifetime: Duration::from_secs(3600),
            stall_factor: 3,
            stall_check_interval: Duration::from_secs(1),
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_secs(60),
        }
    }
}
