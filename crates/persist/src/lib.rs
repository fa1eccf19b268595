//! Loglane persistence: read offsets per log stream.
//!
//! Offsets live in memory and are flushed to SQLite periodically, so the hot path
//! (one `put` per forwarded line) never touches disk.

#![forbid(unsafe_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_SYNC_PERIOD: Duration = Duration::from_secs(10);

/// Path key used for streams read from an API cursor rather than a file.
pub fn cursor_key(key: &str) -> String { format!("cursor-{key}") }

/// Offset bookkeeping for log streams, keyed by `(path, labels)`.
pub trait Positions: Send + Sync {
    /// Last stored offset, 0 when none is stored.
    fn get(&self, path: &str, labels: &str) -> Result<i64>;
    fn put(&self, path: &str, labels: &str, offset: i64);
    fn remove(&self, path: &str, labels: &str);
}

type Key = (String, String);

#[derive(Default)]
struct State {
    offsets: HashMap<Key, i64>,
    dirty: HashSet<Key>,
    removed: HashSet<Key>,
}

/// SQLite-backed positions. Simple and synchronous; writes are batched by `flush`.
pub struct SqlitePositions {
    state: Mutex<State>,
    db: Mutex<rusqlite::Connection>,
}

impl SqlitePositions {
    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening positions db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory positions db")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS positions (
                path   TEXT NOT NULL,
                labels TEXT NOT NULL,
                value  INTEGER NOT NULL,
                PRIMARY KEY (path, labels)
            )",
            [],
        )
        .context("creating positions table")?;

        let mut offsets = HashMap::new();
        {
            let mut stmt = db.prepare("SELECT path, labels, value FROM positions")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let path: String = row.get(0)?;
                let labels: String = row.get(1)?;
                let offset: i64 = row.get(2)?;
                offsets.insert((path, labels), offset);
            }
        }
        debug!(entries = offsets.len(), "positions: loaded");
        Ok(Self { state: Mutex::new(State { offsets, ..State::default() }), db: Mutex::new(db) })
    }

    fn state(&self) -> MutexGuard<'_, State> { self.state.lock().unwrap_or_else(|e| e.into_inner()) }

    /// Write pending changes to SQLite.
    pub fn flush(&self) -> Result<()> {
        let started = Instant::now();
        let (upserts, deletes) = {
            let mut st = self.state();
            let dirty = std::mem::take(&mut st.dirty);
            let removed = std::mem::take(&mut st.removed);
            let upserts: Vec<(Key, i64)> = dirty
                .into_iter()
                .filter_map(|k| st.offsets.get(&k).copied().map(|v| (k, v)))
                .collect();
            (upserts, removed)
        };
        if upserts.is_empty() && deletes.is_empty() { return Ok(()); }

        let mut db = self.db.lock().unwrap_or_else(|e| e.into_inner());
        let tx = db.transaction()?;
        for (path, labels) in &deletes {
            tx.execute("DELETE FROM positions WHERE path = ?1 AND labels = ?2", (path, labels))?;
        }
        for ((path, labels), offset) in &upserts {
            tx.execute(
                "INSERT INTO positions(path, labels, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path, labels) DO UPDATE SET value = excluded.value",
                (path, labels, offset),
            )?;
        }
        tx.commit().context("committing positions")?;
        histogram!("loglane_positions_flush_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("loglane_positions_flush_total", 1u64);
        debug!(upserts = upserts.len(), deletes = deletes.len(), "positions: flushed");
        Ok(())
    }

    /// Flush every `period` until `token` is cancelled, then flush once more.
    pub fn spawn_sync(self: &Arc<Self>, period: Duration, token: CancellationToken) -> JoinHandle<()> {
        let me = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tick.tick() => {
                        if let Err(e) = me.flush() { warn!(error = %e, "positions: flush failed"); }
                    }
                }
            }
            if let Err(e) = me.flush() { warn!(error = %e, "positions: final flush failed"); }
        })
    }

    /// Number of offsets currently tracked.
    pub fn len(&self) -> usize { self.state().offsets.len() }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Positions for SqlitePositions {
    fn get(&self, path: &str, labels: &str) -> Result<i64> {
        Ok(self.state().offsets.get(&(path.to_string(), labels.to_string())).copied().unwrap_or(0))
    }

    fn put(&self, path: &str, labels: &str, offset: i64) {
        let key = (path.to_string(), labels.to_string());
        let mut st = self.state();
        st.removed.remove(&key);
        st.offsets.insert(key.clone(), offset);
        st.dirty.insert(key);
    }

    fn remove(&self, path: &str, labels: &str) {
        let key = (path.to_string(), labels.to_string());
        let mut st = self.state();
        st.offsets.remove(&key);
        st.dirty.remove(&key);
        st.removed.insert(key);
    }
}
