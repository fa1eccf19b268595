mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use loglane_core::cluster::{HashRing, Peer, PeerState};
use loglane_kubehub::ClientArgs;
use loglane_kubetail::TailTuning;
use loglane_podlogs::{Arguments, ClusteringArgs, PodLogsComponent};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Harness {
    component: Arc<PodLogsComponent>,
    backend: Arc<FakeBackend>,
    token: CancellationToken,
    run: JoinHandle<anyhow::Result<()>>,
}

impl Harness {
    async fn start(view: FakeView, ring: Option<Arc<HashRing>>, args: Arguments) -> Self {
        let backend = Arc::new(FakeBackend::new(view));
        let component = Arc::new(
            PodLogsComponent::new(None, backend.clone(), ring, TailTuning::default(), Duration::from_secs(1), args)
                .await
                .unwrap(),
        );
        let token = CancellationToken::new();
        let run = tokio::spawn({
            let (c, t) = (component.clone(), token.clone());
            async move { c.run(t).await }
        });
        Self { component, backend, token, run }
    }

    fn target_instances(&self) -> Vec<String> {
        let mut out: Vec<String> =
            self.component.debug_info().targets.iter().map(|t| t.labels.get("instance").cloned().unwrap_or_default()).collect();
        out.sort();
        out
    }

    async fn stop(self) {
        self.token.cancel();
        self.run.await.unwrap().unwrap();
        assert!(self.component.debug_info().targets.is_empty());
    }
}

#[tokio::test]
async fn only_surviving_target_is_tailed() {
    let (tx, mut rx) = mpsc::channel(16);
    let h = Harness::start(web_cluster(), None, Arguments { forward_to: vec![tx], ..Default::default() }).await;

    eventually("one target", || h.target_instances() == vec!["ns/b:c2"]).await;
    let entry = tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(entry.line, "hello from ns/b:c2");
    assert_eq!(entry.labels.get("job"), "mon/web");
    assert_eq!(*h.backend.client.opened.lock().unwrap(), vec!["ns/b:c2".to_string()]);

    let info = h.component.debug_info();
    assert_eq!(info.discovered_podlogs.len(), 1);
    assert_eq!(info.discovered_podlogs[0].pods.len(), 2);
    let json = serde_json::to_value(&info).unwrap();
    assert_eq!(json["discovered_podlogs"][0]["name"], "web");
    assert_eq!(json["targets"][0]["labels"]["instance"], "ns/b:c2");
    h.stop().await;
}

#[tokio::test]
async fn informer_events_trigger_reconcile() {
    let view = web_cluster();
    let h = Harness::start(view.clone(), None, Arguments::default()).await;
    eventually("first reconcile", || h.target_instances().len() == 1).await;

    view.add_pod(pod("ns", "e", &[("tier", "web")], &["c5"]));
    h.backend.informers.notify();
    eventually("new pod picked up", || h.target_instances() == vec!["ns/b:c2", "ns/e:c5"]).await;
    h.stop().await;
}

#[tokio::test]
async fn client_change_reconnects_and_restarts_tailers() {
    let args = Arguments::default();
    let h = Harness::start(web_cluster(), None, args.clone()).await;
    eventually("first tailer", || h.backend.client.opened.lock().unwrap().len() == 1).await;

    h.component.update(args.clone()).await.unwrap();
    assert_eq!(h.backend.connects.lock().unwrap().len(), 1);

    let moved = Arguments { client: ClientArgs { api_server: Some("https://10.0.0.1:6443".into()), ..Default::default() }, ..args };
    h.component.update(moved).await.unwrap();
    assert_eq!(h.backend.connects.lock().unwrap().len(), 2);
    eventually("informers restarted", || *h.backend.informers.starts.lock().unwrap() == 2).await;
    eventually("tailer restarted", || h.backend.client.opened.lock().unwrap().len() == 2).await;
    h.stop().await;
}

#[tokio::test]
async fn losing_ownership_stops_tailers() {
    let me = Peer { name: "me".into(), addr: String::new(), is_self: true, state: PeerState::Participant };
    let other = Peer { name: "other".into(), addr: String::new(), is_self: false, state: PeerState::Participant };
    let ring = Arc::new(HashRing::new(vec![me]));
    let args = Arguments { clustering: ClusteringArgs { enabled: true }, ..Default::default() };
    let h = Harness::start(web_cluster(), Some(ring.clone()), args).await;
    eventually("owned target", || h.target_instances().len() == 1).await;

    ring.set_peers(vec![other]);
    eventually("target handed off", || h.target_instances().is_empty()).await;
    h.stop().await;
}

#[tokio::test]
async fn conflicting_client_args_are_rejected() {
    let args = Arguments {
        client: ClientArgs { api_server: Some("https://x".into()), kubeconfig_file: Some("/tmp/kubeconfig".into()) },
        ..Default::default()
    };
    let backend = Arc::new(FakeBackend::new(web_cluster()));
    let res = PodLogsComponent::new(None, backend.clone(), None, TailTuning::default(), Duration::from_secs(1), args).await;
    assert!(res.is_err());
    assert!(backend.connects.lock().unwrap().is_empty());
}

#[tokio::test]
async fn second_run_is_an_error() {
    let h = Harness::start(web_cluster(), None, Arguments::default()).await;
    eventually("running", || h.target_instances().len() == 1).await;
    assert!(h.component.run(CancellationToken::new()).await.is_err());
    h.stop().await;
}
