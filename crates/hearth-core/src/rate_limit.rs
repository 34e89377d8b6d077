// ── Sliding-window admission control ──
//
// One independent 60-second window per key; keys are arbitrary strings
// (a token id, or e.g. "login:" + ip). Timestamps come from the tokio
// clock -- monotonic, immune to wall-clock adjustments, and pausable
// under `#[tokio::test(start_paused = true)]`.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

/// In-memory sliding-window rate limiter.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit or refuse one request for `key` against `limit` per
    /// rolling minute. Admission records the timestamp; refusals leave
    /// the window untouched.
    pub async fn check(&self, key: &str, limit: usize) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_owned()).or_default();

        // Drop timestamps that have left the trailing window.
        while window
            .front()
            .is_some_and(|t| now.duration_since(*t) > WINDOW)
        {
            window.pop_front();
        }

        if window.len() >= limit {
            return false;
        }

        window.push_back(now);
        true
    }

    /// Drop windows whose most recent timestamp already left the
    /// interval. Call periodically to bound memory for keys that went
    /// quiet.
    pub async fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .lock()
            .await
            .retain(|_, window| {
                window
                    .back()
                    .is_some_and(|t| now.duration_since(*t) <= WINDOW)
            });
    }

    #[cfg(test)]
    async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}
