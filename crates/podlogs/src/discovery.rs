//! Discovery labels for one container selected by a PodLogs resource.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use loglane_core::labels::sanitize_label_name;
use loglane_core::{LabelSet, INSTANCE_LABEL, JOB_LABEL};
use loglane_kubehub::PodLogs;
use loglane_kubetail::{LABEL_POD_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE, LABEL_POD_UID};

const META: &str = "__meta_kubernetes_";

pub struct DiscoveredContainerRef<'a> {
    pub podlogs: &'a PodLogs,
    pub namespace: &'a Namespace,
    pub pod: &'a Pod,
    pub container: &'a Container,
    pub init: bool,
}

fn add_map(l: &mut LabelSet, prefix: &str, kind: &str, map: Option<&BTreeMap<String, String>>) {
    for (k, v) in map.into_iter().flatten() {
        let k = sanitize_label_name(k);
        l.set(format!("{META}{prefix}_{kind}_{k}"), v.as_str());
        l.set(format!("{META}{prefix}_{kind}present_{k}"), "true");
    }
}

fn add_object_meta(l: &mut LabelSet, prefix: &str, meta: &ObjectMeta) {
    add_map(l, prefix, "label", meta.labels.as_ref());
    add_map(l, prefix, "annotation", meta.annotations.as_ref());
}

/// "true", "false" or "unknown" from the pod's Ready condition.
pub fn pod_ready(pod: &Pod) -> String {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|cs| cs.iter().find(|c| c.type_ == "Ready"))
        .map(|c| c.status.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn build_target_labels(d: &DiscoveredContainerRef<'_>) -> LabelSet {
    let mut l = LabelSet::new();
    let podlogs_ns = d.podlogs.metadata.namespace.as_deref().unwrap_or_default();
    let podlogs_name = d.podlogs.metadata.name.as_deref().unwrap_or_default();
    let pod_ns = d.pod.metadata.namespace.as_deref().unwrap_or_default();
    let pod_name = d.pod.metadata.name.as_deref().unwrap_or_default();
    let pod_uid = d.pod.metadata.uid.as_deref().unwrap_or_default();
    let status = d.pod.status.as_ref();
    let spec = d.pod.spec.as_ref();

    l.set(format!("{META}podlogs_namespace"), podlogs_ns);
    l.set(format!("{META}podlogs_name"), podlogs_name);
    add_object_meta(&mut l, "podlogs", &d.podlogs.metadata);

    l.set(format!("{META}namespace"), pod_ns);
    add_object_meta(&mut l, "namespace", &d.namespace.metadata);

    l.set(format!("{META}pod_name"), pod_name);
    l.set(format!("{META}pod_ip"), status.and_then(|s| s.pod_ip.clone()).unwrap_or_default());
    add_object_meta(&mut l, "pod", &d.pod.metadata);
    l.set(format!("{META}pod_container_init"), d.init.to_string());
    l.set(format!("{META}pod_container_name"), d.container.name.as_str());
    l.set(format!("{META}pod_container_image"), d.container.image.clone().unwrap_or_default());
    l.set(format!("{META}pod_ready"), pod_ready(d.pod));
    l.set(format!("{META}pod_phase"), status.and_then(|s| s.phase.clone()).unwrap_or_default());
    l.set(format!("{META}pod_node_name"), spec.and_then(|s| s.node_name.clone()).unwrap_or_default());
    l.set(format!("{META}pod_host_ip"), status.and_then(|s| s.host_ip.clone()).unwrap_or_default());
    l.set(format!("{META}pod_uid"), pod_uid);

    let controller = d.pod.metadata.owner_references.iter().flatten().find(|r| r.controller == Some(true));
    if let Some(r) = controller {
        l.set(format!("{META}pod_controller_kind"), r.kind.as_str());
        l.set(format!("{META}pod_controller_name"), r.name.as_str());
    }

    l.set(LABEL_POD_NAMESPACE, pod_ns);
    l.set(LABEL_POD_NAME, pod_name);
    l.set(LABEL_POD_CONTAINER_NAME, d.container.name.as_str());
    l.set(LABEL_POD_UID, pod_uid);

    l.set(INSTANCE_LABEL, format!("{}/{}:{}", pod_ns, pod_name, d.container.name));
    l.set(JOB_LABEL, format!("{}/{}", podlogs_ns, podlogs_name));
    l
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
    use loglane_kubehub::PodLogsSpec;

    fn meta(ns: Option<&str>, name: &str, labels: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            namespace: ns.map(str::to_string),
            name: Some(name.into()),
            labels: Some(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
            ..Default::default()
        }
    }

    #[test]
    fn builds_full_label_set() {
        let podlogs = PodLogs { metadata: meta(Some("mon"), "web-logs", &[("team", "a")]), spec: PodLogsSpec::default() };
        let namespace = Namespace { metadata: meta(None, "shop", &[("env", "prod")]), ..Default::default() };
        let mut pod_meta = meta(Some("shop"), "web-0", &[("app.kubernetes.io/name", "web")]);
        pod_meta.uid = Some("uid-1".into());
        pod_meta.owner_references = Some(vec![
            OwnerReference { kind: "Node".into(), name: "n".into(), controller: None, ..Default::default() },
            OwnerReference { kind: "StatefulSet".into(), name: "web".into(), controller: Some(true), ..Default::default() },
        ]);
        let pod = Pod {
            metadata: pod_meta,
            spec: Some(PodSpec { node_name: Some("node-1".into()), ..Default::default() }),
            status: Some(PodStatus {
                pod_ip: Some("10.0.0.7".into()),
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition { type_: "Ready".into(), status: "True".into(), ..Default::default() }]),
                ..Default::default()
            }),
        };
        let container = Container { name: "app".into(), image: Some("web:1".into()), ..Default::default() };

        let l = build_target_labels(&DiscoveredContainerRef { podlogs: &podlogs, namespace: &namespace, pod: &pod, container: &container, init: false });

        assert_eq!(l.get("__meta_kubernetes_podlogs_namespace"), "mon");
        assert_eq!(l.get("__meta_kubernetes_podlogs_label_team"), "a");
        assert_eq!(l.get("__meta_kubernetes_namespace"), "shop");
        assert_eq!(l.get("__meta_kubernetes_namespace_label_env"), "prod");
        assert_eq!(l.get("__meta_kubernetes_pod_label_app_kubernetes_io_name"), "web");
        assert_eq!(l.get("__meta_kubernetes_pod_labelpresent_app_kubernetes_io_name"), "true");
        assert_eq!(l.get("__meta_kubernetes_pod_ip"), "10.0.0.7");
        assert_eq!(l.get("__meta_kubernetes_pod_ready"), "true");
        assert_eq!(l.get("__meta_kubernetes_pod_phase"), "Running");
        assert_eq!(l.get("__meta_kubernetes_pod_node_name"), "node-1");
        assert_eq!(l.get("__meta_kubernetes_pod_container_init"), "false");
        assert_eq!(l.get("__meta_kubernetes_pod_container_image"), "web:1");
        assert_eq!(l.get("__meta_kubernetes_pod_controller_kind"), "StatefulSet");
        assert_eq!(l.get("__meta_kubernetes_pod_controller_name"), "web");
        assert!(!l.has("__meta_kubernetes_pod_host_ip"), "empty values are not set");
        assert_eq!(l.get(LABEL_POD_UID), "uid-1");
        assert_eq!(l.get(INSTANCE_LABEL), "shop/web-0:app");
        assert_eq!(l.get(JOB_LABEL), "mon/web-logs");
    }

    #[test]
    fn ready_is_unknown_without_condition() {
        assert_eq!(pod_ready(&Pod::default()), "unknown");
    }
}
