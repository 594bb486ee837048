//! Per-source health tracker with hysteresis-based status transitions
//! (spec §4.8).

use std::collections::HashMap;
use std::time::SystemTime;

use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failed,
}

struct Inner {
    discover_failures: u32,
    last_discover_err: Option<String>,
    last_discover_fail: Option<SystemTime>,
    parse_failures: HashMap<String, u32>,
    last_parse_err: Option<String>,
    last_parse_fail: Option<SystemTime>,
    last_emitted_status: HealthStatus,
    /// Consecutive successes since the last failure crossed threshold;
    /// recovery to `Healthy` requires this to reach `threshold`.
    consecutive_successes: u32,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            discover_failures: 0,
            last_discover_err: None,
            last_discover_fail: None,
            parse_failures: HashMap::new(),
            last_parse_err: None,
            last_parse_fail: None,
            last_emitted_status: HealthStatus::Healthy,
            consecutive_successes: 0,
        }
    }
}

pub struct HealthTracker {
    threshold: u32,
    inner: Mutex<Inner>,
}

impl HealthTracker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn record_discover_failure(&self, err: impl Into<String>) {
        let mut inner = self.inner.lock();
        inner.discover_failures += 1;
        inner.last_discover_err = Some(err.into());
        inner.last_discover_fail = Some(SystemTime::now());
        inner.consecutive_successes = 0;
    }

    pub fn record_discover_success(&self) {
        let mut inner = self.inner.lock();
        if inner.discover_failures > 0 {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.threshold {
                inner.discover_failures = 0;
                inner.consecutive_successes = 0;
            }
        }
    }

    pub fn record_parse_failure(&self, session_key: &str, err: impl Into<String>) {
        let mut inner = self.inner.lock();
        *inner.parse_failures.entry(session_key.to_string()).or_insert(0) += 1;
        inner.last_parse_err = Some(err.into());
        inner.last_parse_fail = Some(SystemTime::now());
        inner.consecutive_successes = 0;
    }

    pub fn record_parse_success(&self, session_key: &str) {
        let mut inner = self.inner.lock();
        if inner.parse_failures.contains_key(session_key) {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.threshold {
                inner.parse_failures.remove(session_key);
                inner.consecutive_successes = 0;
            }
        }
    }

    /// A session was removed from the store entirely: drop its parse
    /// failure count so it stops counting toward `degraded`.
    pub fn clear_session(&self, session_key: &str) {
        self.inner.lock().parse_failures.remove(session_key);
    }

    fn status_locked(inner: &Inner, threshold: u32) -> HealthStatus {
        if inner.discover_failures >= threshold {
            HealthStatus::Failed
        } else if inner.parse_failures.values().any(|&c| c >= threshold) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    pub fn status(&self) -> HealthStatus {
        let inner = self.inner.lock();
        Self::status_locked(&inner, self.threshold)
    }

    /// Snapshot-and-transition: returns the current status and whether it
    /// changed since the last call to this method.
    pub fn snapshot_and_transition(&self) -> (HealthStatus, bool) {
        let mut inner = self.inner.lock();
        let current = Self::status_locked(&inner, self.threshold);
        let changed = current != inner.last_emitted_status;
        inner.last_emitted_status = current;
        (current, changed)
    }
}
