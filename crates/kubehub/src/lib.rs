//! Loglane kubehub: everything that talks to the Kubernetes API.
//!
//! The tailing and reconciling layers only see the [`KubeClient`] and [`ClusterView`]
//! seams, so they can be driven by fakes in tests.

#![forbid(unsafe_code)]

pub mod client;
pub mod crd;
pub mod informers;
pub mod selector;

pub use client::{ClientArgs, Connector, KubeClient, KubeRsClient, KubeRsConnector, LogStream, LogStreamParams};
pub use crd::{PodLogs, PodLogsSpec};
pub use informers::{ChangeFn, ClusterView, InformerSet};
pub use selector::{Selector, SelectorError};
