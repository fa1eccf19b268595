#![allow(dead_code)]

use std::collections::BTreeMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Namespace, Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use loglane_core::relabel::RelabelConfig;
use loglane_kubehub::{ChangeFn, ClientArgs, ClusterView, KubeClient, LogStream, LogStreamParams, PodLogs, PodLogsSpec, Selector};
use loglane_podlogs::{Backend, Informers};
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

pub fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

pub fn match_labels(pairs: &[(&str, &str)]) -> LabelSelector {
    LabelSelector { match_labels: Some(labels(pairs)), ..Default::default() }
}

pub fn namespace(name: &str, l: &[(&str, &str)]) -> Namespace {
    Namespace { metadata: ObjectMeta { name: Some(name.into()), labels: Some(labels(l)), ..Default::default() }, ..Default::default() }
}

pub fn pod(ns: &str, name: &str, l: &[(&str, &str)], containers: &[&str]) -> Pod {
    Pod {
        metadata: ObjectMeta {
            namespace: Some(ns.into()),
            name: Some(name.into()),
            uid: Some(format!("uid-{name}")),
            labels: Some(labels(l)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: containers.iter().map(|c| Container { name: c.to_string(), ..Default::default() }).collect(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn podlogs(ns: &str, name: &str, selector: LabelSelector, relabelings: Vec<RelabelConfig>) -> PodLogs {
    let mut pl = PodLogs::new(name, PodLogsSpec { selector, namespace_selector: LabelSelector::default(), relabelings });
    pl.metadata.namespace = Some(ns.into());
    pl
}

pub fn drop_frontend() -> RelabelConfig {
    RelabelConfig {
        source_labels: vec!["__meta_kubernetes_pod_label_app".into()],
        regex: Some("frontend".into()),
        action: Some("drop".into()),
        ..Default::default()
    }
}

/// The cluster used by most tests: PodLogs `mon/web` selects `tier=web` pods;
/// `ns/a` runs the frontend, `ns/b` the backend.
pub fn web_cluster() -> FakeView {
    let view = FakeView::default();
    view.add_namespace(namespace("mon", &[]));
    view.add_namespace(namespace("ns", &[("env", "prod")]));
    view.add_podlogs(podlogs("mon", "web", match_labels(&[("tier", "web")]), vec![drop_frontend()]));
    view.add_pod(pod("ns", "a", &[("tier", "web"), ("app", "frontend")], &["c1"]));
    view.add_pod(pod("ns", "b", &[("tier", "web"), ("app", "backend")], &["c2"]));
    view
}

#[derive(Default)]
struct ViewState {
    podlogs: Vec<PodLogs>,
    namespaces: BTreeMap<String, Namespace>,
    pods: Vec<Pod>,
    fail_podlogs: bool,
    fail_pods: bool,
}

/// In-memory cluster state.
#[derive(Default, Clone)]
pub struct FakeView(Arc<Mutex<ViewState>>);

impl FakeView {
    fn state(&self) -> std::sync::MutexGuard<'_, ViewState> { self.0.lock().unwrap() }

    pub fn add_podlogs(&self, pl: PodLogs) { self.state().podlogs.push(pl); }
    pub fn add_namespace(&self, ns: Namespace) {
        let name = ns.metadata.name.clone().unwrap();
        self.state().namespaces.insert(name, ns);
    }
    pub fn add_pod(&self, p: Pod) { self.state().pods.push(p); }
    pub fn fail_podlogs(&self) { self.state().fail_podlogs = true; }
    pub fn fail_pods(&self) { self.state().fail_pods = true; }
}

impl ClusterView for FakeView {
    fn list_pod_logs(&self, selector: &Selector) -> Result<Vec<Arc<PodLogs>>> {
        let st = self.state();
        if st.fail_podlogs { bail!("podlogs unavailable"); }
        Ok(st.podlogs.iter().filter(|p| selector.matches_opt(p.metadata.labels.as_ref())).cloned().map(Arc::new).collect())
    }

    fn get_namespace(&self, name: &str) -> Result<Arc<Namespace>> {
        self.state().namespaces.get(name).cloned().map(Arc::new).ok_or_else(|| anyhow!("namespace {name:?} not found"))
    }

    fn list_pods(&self, selector: &Selector) -> Result<Vec<Arc<Pod>>> {
        let st = self.state();
        if st.fail_pods { bail!("pods unavailable"); }
        Ok(st.pods.iter().filter(|p| selector.matches_opt(p.metadata.labels.as_ref())).cloned().map(Arc::new).collect())
    }
}

/// Hands out `view` and remembers the change callback of the last start.
#[derive(Default)]
pub struct FakeInformers {
    pub view: FakeView,
    pub on_change: Mutex<Option<ChangeFn>>,
    pub starts: Mutex<usize>,
}

impl FakeInformers {
    pub fn notify(&self) {
        let f = self.on_change.lock().unwrap().clone();
        if let Some(f) = f { f(); }
    }
}

#[async_trait]
impl Informers for FakeInformers {
    async fn start(&self, on_change: ChangeFn, _sync_timeout: Duration) -> Result<Arc<dyn ClusterView>> {
        *self.on_change.lock().unwrap() = Some(on_change);
        *self.starts.lock().unwrap() += 1;
        Ok(Arc::new(self.view.clone()))
    }
}

/// Never yields data and never ends.
struct Hang;

impl AsyncRead for Hang {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Poll::Pending
    }
}

/// Every container's stream carries one line naming it, then stays open.
#[derive(Default)]
pub struct FakeClient {
    pub opened: Mutex<Vec<String>>,
}

#[async_trait]
impl KubeClient for FakeClient {
    async fn log_stream(&self, namespace: &str, pod: &str, params: &LogStreamParams) -> Result<LogStream> {
        let id = format!("{namespace}/{pod}:{}", params.container);
        self.opened.lock().unwrap().push(id.clone());
        let line = format!("2024-01-01T00:00:00Z hello from {id}\n");
        Ok(Box::pin(Cursor::new(line.into_bytes()).chain(Hang)))
    }

    async fn get_pod(&self, _namespace: &str, _name: &str) -> Result<Pod> { bail!("not needed") }
}

pub struct FakeBackend {
    pub client: Arc<FakeClient>,
    pub informers: Arc<FakeInformers>,
    pub connects: Mutex<Vec<ClientArgs>>,
}

impl FakeBackend {
    pub fn new(view: FakeView) -> Self {
        Self {
            client: Arc::new(FakeClient::default()),
            informers: Arc::new(FakeInformers { view, ..Default::default() }),
            connects: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn connect(&self, args: &ClientArgs) -> Result<(Arc<dyn KubeClient>, Arc<dyn Informers>)> {
        self.connects.lock().unwrap().push(args.clone());
        Ok((self.client.clone(), self.informers.clone()))
    }
}

pub async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..200 {
        if f() { return; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
