//! Cluster membership and consistent-hash ownership.

use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

const DEFAULT_TOKENS_PER_PEER: usize = 128;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("need {wanted} owners but only {have} eligible peers")]
    NotEnoughPeers { wanted: usize, have: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    #[default]
    Participant,
    /// Leaving the cluster; may still serve reads.
    Terminating,
    /// Observes the cluster but never owns keys.
    Viewer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub name: String,
    pub addr: String,
    #[serde(default)]
    pub is_self: bool,
    #[serde(default)]
    pub state: PeerState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read,
    ReadWrite,
}

impl Op {
    fn eligible(self, state: PeerState) -> bool {
        match self {
            Op::ReadWrite => state == PeerState::Participant,
            Op::Read => state != PeerState::Viewer,
        }
    }
}

/// Ownership lookups over a set of peers.
pub trait Cluster: Send + Sync {
    /// Owners of `key`, first entry being the primary owner.
    fn lookup(&self, key: u64, replication_factor: usize, op: Op) -> Result<Vec<Peer>, ClusterError>;
    fn peers(&self) -> Vec<Peer>;
}

/// Ring key for an arbitrary string (e.g. a rendered label set).
pub fn string_key(s: &str) -> u64 {
    let mut h = FnvHasher::default();
    h.write(s.as_bytes());
    h.finish()
}

// splitmix64 finalizer; spreads FNV output across the whole ring.
fn mix(mut x: u64) -> u64 {
    x ^= x >> 30;
    x = x.wrapping_mul(0xbf58476d1ce4e5b9);
    x ^= x >> 27;
    x = x.wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}

#[derive(Debug, Default)]
struct RingState {
    peers: Vec<Peer>,
    /// (token, index into peers), sorted by token.
    tokens: Vec<(u64, usize)>,
}

impl RingState {
    fn build(peers: Vec<Peer>, tokens_per_peer: usize) -> Self {
        let mut tokens = Vec::with_capacity(peers.len() * tokens_per_peer);
        for (idx, p) in peers.iter().enumerate() {
            for i in 0..tokens_per_peer {
                let mut h = FnvHasher::default();
                h.write(p.name.as_bytes());
                h.write(&(i as u64).to_le_bytes());
                tokens.push((mix(h.finish()), idx));
            }
        }
        tokens.sort_unstable();
        Self { peers, tokens }
    }
}

/// Consistent hash ring over a static (but replaceable) peer list.
pub struct HashRing {
    tokens_per_peer: usize,
    state: ArcSwap<RingState>,
    epoch: AtomicU64,
    changes: watch::Sender<u64>,
}

impl HashRing {
    pub fn new(peers: Vec<Peer>) -> Self { Self::with_tokens(peers, DEFAULT_TOKENS_PER_PEER) }

    pub fn with_tokens(peers: Vec<Peer>, tokens_per_peer: usize) -> Self {
        let tokens_per_peer = tokens_per_peer.max(1);
        let (changes, _) = watch::channel(0);
        Self {
            tokens_per_peer,
            state: ArcSwap::from_pointee(RingState::build(peers, tokens_per_peer)),
            epoch: AtomicU64::new(0),
            changes,
        }
    }

    /// Single-node ring; every key is owned locally.
    pub fn standalone(name: &str) -> Self {
        Self::new(vec![Peer { name: name.to_string(), addr: String::new(), is_self: true, state: PeerState::Participant }])
    }

    /// Replace membership and notify subscribers.
    pub fn set_peers(&self, peers: Vec<Peer>) {
        let count = peers.len();
        self.state.store(Arc::new(RingState::build(peers, self.tokens_per_peer)));
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        self.changes.send_replace(epoch);
        info!(peers = count, epoch, "cluster membership changed");
    }

    /// Receives the membership epoch each time peers change.
    pub fn subscribe(&self) -> watch::Receiver<u64> { self.changes.subscribe() }
}

impl Cluster for HashRing {
    fn lookup(&self, key: u64, replication_factor: usize, op: Op) -> Result<Vec<Peer>, ClusterError> {
        let state = self.state.load();
        let eligible = state.peers.iter().filter(|p| op.eligible(p.state)).count();
        if replication_factor > eligible {
            return Err(ClusterError::NotEnoughPeers { wanted: replication_factor, have: eligible });
        }
        let mut out: Vec<Peer> = Vec::with_capacity(replication_factor);
        if replication_factor == 0 { return Ok(out); }
        let key = mix(key);
        let start = state.tokens.partition_point(|(t, _)| *t < key);
        let n = state.tokens.len();
        for i in 0..n {
            let (_, idx) = state.tokens[(start + i) % n];
            let peer = &state.peers[idx];
            if !op.eligible(peer.state) || out.iter().any(|p| p.name == peer.name) { continue; }
            out.push(peer.clone());
            if out.len() == replication_factor { break; }
        }
        Ok(out)
    }

    fn peers(&self) -> Vec<Peer> { self.state.load().peers.clone() }
}
