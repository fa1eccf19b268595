//! Rolling average of the gap between consecutive log lines.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct Window {
    deltas: Vec<Duration>,
    next: usize,
    last: Option<Instant>,
}

#[derive(Debug)]
pub struct RollingAverageCalculator {
    size: usize,
    min_entries: usize,
    min_duration: Duration,
    default_duration: Duration,
    window: Mutex<Window>,
}

impl RollingAverageCalculator {
    pub fn new(size: usize, min_entries: usize, min_duration: Duration, default_duration: Duration) -> Self {
        let size = size.max(1);
        Self {
            size,
            min_entries,
            min_duration,
            default_duration,
            window: Mutex::new(Window { deltas: Vec::with_capacity(size.min(1024)), next: 0, last: None }),
        }
    }

    fn window(&self) -> MutexGuard<'_, Window> { self.window.lock().unwrap_or_else(|e| e.into_inner()) }

    pub fn add_timestamp(&self, at: Instant) {
        let mut w = self.window();
        let Some(prev) = w.last.replace(at) else { return };
        let delta = at.saturating_duration_since(prev);
        if w.deltas.len() < self.size {
            w.deltas.push(delta);
        } else {
            let i = w.next;
            w.deltas[i] = delta;
            w.next = (i + 1) % self.size;
        }
    }

    /// Mean gap, `default_duration` while there are too few samples, never below `min_duration`.
    pub fn average(&self) -> Duration {
        let w = self.window();
        if w.deltas.len() < self.min_entries || w.deltas.is_empty() {
            return self.default_duration;
        }
        let total: Duration = w.deltas.iter().sum();
        let avg = total / w.deltas.len() as u32;
        avg.max(self.min_duration)
    }

    pub fn last(&self) -> Option<Instant> { self.window().last }

    /// `(average, since_last)` when more than `factor` average gaps have passed since the
    /// last line. Never fires before the first line.
    pub fn stalled(&self, now: Instant, factor: u32) -> Option<(Duration, Duration)> {
        let last = self.last()?;
        let avg = self.average();
        let since = now.saturating_duration_since(last);
        (since > avg * factor).then_some((avg, since))
    }
}
