//! `PodLogs` custom resource: selects pods whose logs are collected and how they are labeled.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use loglane_core::relabel::RelabelConfig;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[kube(
    group = "monitoring.grafana.com",
    version = "v1alpha2",
    kind = "PodLogs",
    plural = "podlogs",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct PodLogsSpec {
    /// Pods to collect from.
    #[serde(default)]
    pub selector: LabelSelector,
    /// Namespaces those pods may live in.
    #[serde(default)]
    pub namespace_selector: LabelSelector,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub relabelings: Vec<RelabelConfig>,
}
