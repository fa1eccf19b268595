#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use loglane_core::LabelSet;
use loglane_kubehub::{ClientArgs, Connector, KubeClient, LogStream, LogStreamParams};
use loglane_kubetail::{prepare_labels, Target, LABEL_POD_CONTAINER_NAME, LABEL_POD_NAME, LABEL_POD_NAMESPACE, LABEL_POD_UID};
use loglane_persist::Positions;
use tokio::io::{AsyncRead, ReadBuf};
use tokio_util::io::StreamReader;

pub fn ts(secs: u32) -> DateTime<Utc> { Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, secs).unwrap() }

pub fn log_line(at: DateTime<Utc>, text: &str) -> String {
    format!("{} {}\n", at.to_rfc3339_opts(SecondsFormat::Nanos, true), text)
}

pub fn discovered(ns: &str, pod: &str, container: &str, uid: &str) -> LabelSet {
    [(LABEL_POD_NAMESPACE, ns), (LABEL_POD_NAME, pod), (LABEL_POD_CONTAINER_NAME, container), (LABEL_POD_UID, uid)]
        .into_iter()
        .collect()
}

pub fn target(ns: &str, pod: &str, container: &str, uid: &str) -> Arc<Target> {
    let l = discovered(ns, pod, container, uid);
    Arc::new(Target::new(l.clone(), prepare_labels(&l, "test").unwrap()))
}

pub fn pod_with_uid(ns: &str, name: &str, uid: &str) -> Pod {
    Pod {
        metadata: ObjectMeta { namespace: Some(ns.into()), name: Some(name.into()), uid: Some(uid.into()), ..Default::default() },
        ..Default::default()
    }
}

pub enum StreamSpec {
    /// Lines followed by end of stream.
    Lines(Vec<String>),
    /// Lines, then the stream stays open without data.
    LinesThenHang(Vec<String>),
    /// Opening the stream fails.
    Fail(&'static str),
    /// Hangs; `dropped` is set after a slow drop of the stream.
    SlowDrop { dropped: Arc<AtomicBool>, delay: Duration },
}

fn hanging(lines: Vec<String>) -> LogStream {
    let s = async_stream::stream! {
        for l in lines {
            yield Ok::<_, std::io::Error>(Cursor::new(l.into_bytes()));
        }
        futures::future::pending::<()>().await;
    };
    Box::pin(StreamReader::new(s))
}

struct SlowDropStream {
    inner: LogStream,
    dropped: Arc<AtomicBool>,
    delay: Duration,
}

impl AsyncRead for SlowDropStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        self.inner.as_mut().poll_read(cx, buf)
    }
}

impl Drop for SlowDropStream {
    fn drop(&mut self) {
        std::thread::sleep(self.delay);
        self.dropped.store(true, Ordering::SeqCst);
    }
}

/// Scripted Kubernetes client. Streams are served per `ns/pod:container` in order;
/// once the script runs out the stream hangs.
#[derive(Default)]
pub struct FakeClient {
    streams: Mutex<HashMap<String, VecDeque<StreamSpec>>>,
    pods: Mutex<HashMap<String, Pod>>,
    pub opened: Mutex<Vec<(String, LogStreamParams)>>,
}

impl FakeClient {
    pub fn script(&self, id: &str, spec: StreamSpec) {
        self.streams.lock().unwrap().entry(id.to_string()).or_default().push_back(spec);
    }

    pub fn set_pod(&self, pod: Pod) {
        let key = format!("{}/{}", pod.metadata.namespace.clone().unwrap_or_default(), pod.metadata.name.clone().unwrap_or_default());
        self.pods.lock().unwrap().insert(key, pod);
    }

    pub fn opens(&self) -> usize { self.opened.lock().unwrap().len() }

    pub fn opens_for(&self, id: &str) -> Vec<LogStreamParams> {
        self.opened.lock().unwrap().iter().filter(|(k, _)| k == id).map(|(_, p)| p.clone()).collect()
    }
}

#[async_trait::async_trait]
impl KubeClient for FakeClient {
    async fn log_stream(&self, namespace: &str, pod: &str, params: &LogStreamParams) -> Result<LogStream> {
        let id = format!("{}/{}:{}", namespace, pod, params.container);
        self.opened.lock().unwrap().push((id.clone(), params.clone()));
        let next = self.streams.lock().unwrap().get_mut(&id).and_then(|q| q.pop_front());
        match next {
            Some(StreamSpec::Lines(lines)) => Ok(Box::pin(Cursor::new(lines.concat().into_bytes()))),
            Some(StreamSpec::LinesThenHang(lines)) => Ok(hanging(lines)),
            Some(StreamSpec::Fail(msg)) => Err(anyhow!(msg)),
            Some(StreamSpec::SlowDrop { dropped, delay }) => {
                Ok(Box::pin(SlowDropStream { inner: hanging(Vec::new()), dropped, delay }))
            }
            None => Ok(hanging(Vec::new())),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<Pod> {
        self.pods
            .lock()
            .unwrap()
            .get(&format!("{}/{}", namespace, name))
            .cloned()
            .ok_or_else(|| anyhow!("pods {:?} not found", name))
    }
}

pub struct FakeConnector(pub Arc<FakeClient>);

#[async_trait::async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _args: &ClientArgs) -> Result<Arc<dyn KubeClient>> { Ok(self.0.clone()) }
}

/// In-memory positions that log every write and note, for each removal, whether
/// `stopped` was already set.
#[derive(Default)]
pub struct RecordingPositions {
    offsets: Mutex<HashMap<(String, String), i64>>,
    pub puts: Mutex<Vec<(String, i64)>>,
    pub removes: Mutex<Vec<(String, bool)>>,
    pub stopped: Arc<AtomicBool>,
}

impl Positions for RecordingPositions {
    fn get(&self, path: &str, labels: &str) -> Result<i64> {
        Ok(self.offsets.lock().unwrap().get(&(path.to_string(), labels.to_string())).copied().unwrap_or(0))
    }

    fn put(&self, path: &str, labels: &str, offset: i64) {
        self.offsets.lock().unwrap().insert((path.to_string(), labels.to_string()), offset);
        self.puts.lock().unwrap().push((path.to_string(), offset));
    }

    fn remove(&self, path: &str, labels: &str) {
        self.offsets.lock().unwrap().remove(&(path.to_string(), labels.to_string()));
        self.removes.lock().unwrap().push((path.to_string(), self.stopped.load(Ordering::SeqCst)));
    }
}

pub async fn eventually(what: &str, mut f: impl FnMut() -> bool) {
    for _ in 0..300 {
        if f() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
