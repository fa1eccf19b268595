//! One pod container to collect logs from.

use std::fmt;
use std::hash::Hasher;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use fnv::FnvHasher;
use loglane_core::{LabelError, LabelSet, INSTANCE_LABEL, JOB_LABEL, META_LABEL_PREFIX};
use loglane_persist::cursor_key;
use serde::Serialize;

use crate::{LABEL_POD_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE, LABEL_POD_UID};

#[derive(Debug, Default)]
struct Health {
    last_error: Option<String>,
    last_entry: Option<DateTime<Utc>>,
}

/// Identity, labels and health of a tailed container. Targets are rebuilt on every
/// sync; continuity between syncs comes only from [`Target::hash`] and the UID.
#[derive(Debug)]
pub struct Target {
    discovery_labels: LabelSet,
    labels: LabelSet,
    namespace: String,
    name: String,
    container: String,
    uid: String,
    id: String,
    hash: u64,
    health: RwLock<Health>,
}

impl Target {
    /// `labels` must be the output of [`prepare_labels`]; internal labels are kept for
    /// identity and dropped from the public label set.
    pub fn new(discovery_labels: LabelSet, labels: LabelSet) -> Self {
        let namespace = labels.get(LABEL_POD_NAMESPACE).to_string();
        let name = labels.get(LABEL_POD_NAME).to_string();
        let container = labels.get(LABEL_POD_CONTAINER_NAME).to_string();
        let uid = labels.get(LABEL_POD_UID).to_string();
        let id = format!("{}/{}:{}", namespace, name, container);
        let public = labels.without_internal();

        let mut h = FnvHasher::default();
        h.write(&public.hash().to_le_bytes());
        h.write(id.as_bytes());
        h.write(uid.as_bytes());

        Self {
            discovery_labels,
            labels: public,
            namespace,
            name,
            container,
            uid,
            id,
            hash: h.finish(),
            health: RwLock::new(Health::default()),
        }
    }

    /// Labels before relabeling, kept for debugging.
    pub fn discovery_labels(&self) -> &LabelSet { &self.discovery_labels }
    /// Labels attached to every entry read from this target.
    pub fn labels(&self) -> &LabelSet { &self.labels }
    pub fn namespace(&self) -> &str { &self.namespace }
    pub fn pod_name(&self) -> &str { &self.name }
    pub fn container_name(&self) -> &str { &self.container }
    pub fn uid(&self) -> &str { &self.uid }
    pub fn hash(&self) -> u64 { self.hash }

    /// Record a read at `time`; `error` is the failure that ended the last attempt, if any.
    pub fn report(&self, time: DateTime<Utc>, error: Option<String>) {
        let mut h = self.health_mut();
        h.last_entry = Some(time);
        h.last_error = error;
    }

    pub fn last_entry(&self) -> Option<DateTime<Utc>> { self.health().last_entry }
    pub fn last_error(&self) -> Option<String> { self.health().last_error.clone() }

    fn health(&self) -> RwLockReadGuard<'_, Health> { self.health.read().unwrap_or_else(|e| e.into_inner()) }
    fn health_mut(&self) -> RwLockWriteGuard<'_, Health> { self.health.write().unwrap_or_else(|e| e.into_inner()) }

    pub fn debug_info(&self) -> DebugInfoTarget {
        let h = self.health();
        DebugInfoTarget {
            labels: self.labels.to_map(),
            discovery_labels: self.discovery_labels.to_map(),
            last_error: h.last_error.clone(),
            update_time: h.last_entry,
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.id) }
}

/// Per-target state shown on the debug surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DebugInfoTarget {
    pub labels: std::collections::BTreeMap<String, String>,
    pub discovery_labels: std::collections::BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
}

/// Validate and finalize a discovered label set: the four `__pod_*__` labels must be
/// present; `instance` defaults to `ns/pod:container` and `job` to `default_job`;
/// `__meta_` labels are removed.
pub fn prepare_labels(lset: &LabelSet, default_job: &str) -> Result<LabelSet, LabelError> {
    for name in [LABEL_POD_NAMESPACE, LABEL_POD_NAME, LABEL_POD_CONTAINER_NAME, LABEL_POD_UID] {
        if lset.get(name).is_empty() {
            return Err(LabelError::Missing(name.to_string()));
        }
    }
    let mut out = lset.without_prefix(META_LABEL_PREFIX);
    if !lset.has(INSTANCE_LABEL) {
        let instance = format!(
            "{}/{}:{}",
            lset.get(LABEL_POD_NAMESPACE),
            lset.get(LABEL_POD_NAME),
            lset.get(LABEL_POD_CONTAINER_NAME)
        );
        out.set(INSTANCE_LABEL, instance);
    }
    if !lset.has(JOB_LABEL) {
        out.set(JOB_LABEL, default_job);
    }
    Ok(out)
}

/// Positions key of a target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionsEntry {
    pub path: String,
    pub labels: String,
}

pub fn entry_for_target(target: &Target) -> PositionsEntry {
    PositionsEntry {
        path: cursor_key(&format!("{}:{}", target, target.uid())),
        labels: target.labels().to_string(),
    }
}
