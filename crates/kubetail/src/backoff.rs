//! Exponential retry delay.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    current: Duration,
    retries: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self { Self { min, max: max.max(min), current: min, retries: 0 } }

    pub fn reset(&mut self) {
        self.current = self.min;
        self.retries = 0;
    }

    pub fn retries(&self) -> u32 { self.retries }

    /// Delay for the next retry; each call doubles the following one up to `max`.
    pub fn next_delay(&mut self) -> Duration {
        let d = self.current;
        self.current = (self.current * 2).min(self.max);
        self.retries += 1;
        d
    }

    /// Sleep for the next delay. Returns false if `token` was cancelled first.
    pub async fn wait(&mut self, token: &CancellationToken) -> bool {
        let d = self.next_delay();
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }
}
