//! Loglane podlogs: turns `PodLogs` resources into tailed containers.
//!
//! The [`Controller`] watches Namespaces, Pods and PodLogs and asks the
//! [`Reconciler`] to rebuild the target list whenever any of them change; the
//! reconciler hands the result to the shared tailer [`Manager`](loglane_kubetail::Manager).

#![forbid(unsafe_code)]

pub mod component;
pub mod controller;
pub mod discovery;
pub mod reconciler;

pub use component::{Arguments, Backend, ClusteringArgs, KubeBackend, PodLogsComponent, PodLogsDebugInfo};
pub use controller::{Controller, Informers, KubeInformers};
pub use reconciler::{distribute_targets, DiscoveredContainer, DiscoveredPod, DiscoveredPodLogs, Reconciler};
