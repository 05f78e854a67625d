//! Per-agent request budget.
//!
//! Each agent gets a fixed window of `window_secs` with a request budget;
//! the count resets when the window rolls over. A run that cannot get budget
//! within the configured wait is handed back to the dispatcher as a transient
//! failure and retried later.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::RateLimitConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    opened: Instant,
    used: u32,
}

#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            config: config.clone(),
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Take one request from `agent`'s current window.
    ///
    /// Returns `false` when the window's budget is spent.
    pub fn try_acquire(&self, agent: &str) -> bool {
        if !self.config.enabled {
            return true;
        }
        let budget = self.config.requests_for(agent);
        let now = Instant::now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        let window = windows.entry(agent.to_string()).or_insert(Window {
            opened: now,
            used: 0,
        });
        if now.duration_since(window.opened) >= self.config.window() {
            window.opened = now;
            window.used = 0;
        }
        if window.used >= budget {
            return false;
        }
        window.used += 1;
        true
    }

    /// Wait up to `wait` for budget, checking once a second.
    pub async fn acquire(&self, agent: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if self.try_acquire(agent) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(agent, "rate limit budget spent");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}
