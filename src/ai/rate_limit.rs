/// Sliding-window rate limiter keyed by provider.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

fn default_window_secs() -> u64 {
    60
}

fn default_max_requests() -> usize {
    60
}

/// Window length and request ceiling for one provider key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct RateLimitSettings {
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    #[serde(default = "default_max_requests")]
    pub max_requests: usize,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            max_requests: default_max_requests(),
        }
    }
}

impl RateLimitSettings {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Per-key request timestamps. All updates for one key happen under a single
/// lock acquisition, so check-and-record is atomic.
pub struct RateLimiter {
    default: RateLimitSettings,
    overrides: HashMap<String, RateLimitSettings>,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(default: RateLimitSettings, overrides: HashMap<String, RateLimitSettings>) -> Self {
        Self {
            default,
            overrides,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings_for(&self, key: &str) -> RateLimitSettings {
        self.overrides.get(key).copied().unwrap_or(self.default)
    }

    /// Record a request for `key` if the window has room.
    ///
    /// Returns `false` without recording anything when the key is over its
    /// limit, so a rejected call does not eat into the window.
    pub fn try_acquire(&self, key: &str) -> bool {
        self.try_acquire_at(key, Instant::now())
    }

    fn try_acquire_at(&self, key: &str, now: Instant) -> bool {
        let settings = self.settings_for(key);
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let window = windows.entry(key.to_string()).or_default();
        prune(window, now, settings.window());

        if window.len() >= settings.max_requests {
            return false;
        }
        window.push_back(now);
        true
    }

    /// Keys with at least one request still inside their window.
    pub fn active_keys(&self) -> usize {
        let now = Instant::now();
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        windows.retain(|key, window| {
            let span = self
                .overrides
                .get(key)
                .copied()
                .unwrap_or(self.default)
                .window();
            prune(window, now, span);
            !window.is_empty()
        });
        windows.len()
    }

    pub fn reset(&self) {
        match self.windows.lock() {
            Ok(mut guard) => guard.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

fn prune(window: &mut VecDeque<Instant>, now: Instant, span: Duration) {
    while let Some(front) = window.front() {
        if now.duration_since(*front) >= span {
            window.pop_front();
        } else {
            break;
        }
    }
}
