//! `tail`: tails pods matching a label selector without PodLogs resources.

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use loglane_core::LabelSet;
use loglane_kubetail::{LABEL_POD_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE, LABEL_POD_UID};

/// Discovery labels for every container of `pods`, init containers first.
pub fn targets_for(pods: &[Pod]) -> Vec<LabelSet> {
    let mut out = Vec::new();
    for pod in pods {
        let ns = pod.metadata.namespace.as_deref().unwrap_or_default();
        let name = pod.metadata.name.as_deref().unwrap_or_default();
        let uid = pod.metadata.uid.as_deref().unwrap_or_default();
        let Some(spec) = pod.spec.as_ref() else { continue };
        let containers = spec.init_containers.iter().flatten().chain(spec.containers.iter());
        for c in containers {
            let mut l = LabelSet::new();
            l.set(LABEL_POD_NAMESPACE, ns);
            l.set(LABEL_POD_NAME, name);
            l.set(LABEL_POD_CONTAINER_NAME, c.name.as_str());
            l.set(LABEL_POD_UID, uid);
            l.set("namespace", ns);
            l.set("pod", name);
            l.set("container", c.name.as_str());
            out.push(l);
        }
    }
    out
}

pub async fn list_pods(client: kube::Client, namespace: Option<&str>, selector: Option<&str>) -> Result<Vec<Pod>> {
    let api: Api<Pod> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let mut lp = ListParams::default();
    if let Some(sel) = selector { lp = lp.labels(sel); }
    Ok(api.list(&lp).await.context("listing pods")?.items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn one_target_per_container() {
        let pod = Pod {
            metadata: ObjectMeta { namespace: Some("shop".into()), name: Some("web-0".into()), uid: Some("u1".into()), ..Default::default() },
            spec: Some(PodSpec {
                init_containers: Some(vec![Container { name: "migrate".into(), ..Default::default() }]),
                containers: vec![Container { name: "app".into(), ..Default::default() }],
                ..Default::default()
            }),
            ..Default::default()
        };
        let targets = targets_for(&[pod, Pod::default()]);
        let names: Vec<_> = targets.iter().map(|l| l.get("container").to_string()).collect();
        assert_eq!(names, vec!["migrate", "app"]);
        assert_eq!(targets[1].get(LABEL_POD_UID), "u1");
        assert!(loglane_kubetail::prepare_labels(&targets[1], "tail").is_ok());
    }
}
