//! Fixed-window per-device action limiter.
//!
//! Each device gets a window that starts at its first action; once the
//! window is `window` old it is replaced by a fresh one (no sliding).
//! Entries live in a DashMap so the check never touches the matching lock.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::clock::SharedClock;

#[derive(Debug, Clone, Copy)]
struct RateWindow {
    window_start: DateTime<Utc>,
    count: u32,
}

#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, RateWindow>>,
    clock: SharedClock,
    window: Duration,
    max_actions: u32,
}

impl RateLimiter {
    pub fn new(clock: SharedClock, window: Duration, max_actions: u32) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            clock,
            window,
            max_actions,
        }
    }

    /// Count one action for `device_id`. Returns false when the budget is spent.
    pub fn allow(&self, device_id: &str) -> bool {
        let now = self.clock.now();
        let mut entry = self
            .windows
            .entry(device_id.to_string())
            .or_insert(RateWindow {
                window_start: now,
                count: 0,
            });
        let window = entry.value_mut();

        if now - window.window_start >= self.window {
            *window = RateWindow {
                window_start: now,
                count: 0,
            };
        }
        if window.count >= self.max_actions {
            return false;
        }
        window.count += 1;
        true
    }

    /// Drop windows that have fully elapsed.
    pub fn retain_recent(&self) {
        let now = self.clock.now();
        self.windows
            .retain(|_, w| now - w.window_start < self.window);
    }

    pub fn tracked_devices(&self) -> usize {
        self.windows.len()
    }
}
