//! Deciding whether a container whose log stream ended will ever produce more logs.

use anyhow::{anyhow, Result};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStatus, Pod};

use crate::target::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    App,
    Init,
    Ephemeral,
}

/// True when a container in `state` will not run again. `restart_policy` is the
/// pod's policy; `None` means the API default, `Always`.
///
/// App containers restart when waiting or running, when terminated under `Always`,
/// or when terminated non-zero under any policy but `Never`. Init containers are the
/// same except that `Always` alone does not restart a successful one. Ephemeral
/// containers never restart.
pub fn will_not_restart(kind: ContainerKind, state: &ContainerState, restart_policy: Option<&str>) -> bool {
    if state.waiting.is_some() || state.running.is_some() {
        return false;
    }
    let policy = restart_policy.unwrap_or("Always");
    let failed = state.terminated.as_ref().is_some_and(|t| t.exit_code != 0);
    let terminated = state.terminated.is_some();
    match kind {
        ContainerKind::App => !((terminated && policy == "Always") || (failed && policy != "Never")),
        ContainerKind::Init => !(failed && policy != "Never"),
        ContainerKind::Ephemeral => true,
    }
}

fn find_status<'a>(pod: &'a Pod, container: &str) -> Option<(&'a ContainerStatus, ContainerKind)> {
    let status = pod.status.as_ref()?;
    let lists = [
        (&status.container_statuses, ContainerKind::App),
        (&status.init_container_statuses, ContainerKind::Init),
        (&status.ephemeral_container_statuses, ContainerKind::Ephemeral),
    ];
    lists
        .into_iter()
        .find_map(|(list, kind)| list.iter().flatten().find(|s| s.name == container).map(|s| (s, kind)))
}

/// Whether the target's container has terminated for good, judged from a fresh `pod`.
/// A pod whose UID differs from the target's is a different pod, so the target is gone.
pub fn container_terminated(pod: &Pod, target: &Target) -> Result<bool> {
    if pod.metadata.uid.as_deref().unwrap_or_default() != target.uid() {
        return Ok(true);
    }
    let (status, kind) = find_status(pod, target.container_name())
        .ok_or_else(|| anyhow!("could not find container {:?} in pod status", target.container_name()))?;
    let state = status.state.clone().unwrap_or_default();
    let policy = pod.spec.as_ref().and_then(|s| s.restart_policy.as_deref());
    Ok(will_not_restart(kind, &state, policy))
}
