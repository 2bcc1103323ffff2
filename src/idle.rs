//! Activity clock and the idle-shutdown decision.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Monotonic timestamp of the last observed proxy output.
///
/// Cloned into the stdout forwarder; every line touches it. Start/stop transitions do not.
#[derive(Debug, Clone)]
pub struct ActivityTracker {
    last: Arc<Mutex<Instant>>,
}

impl ActivityTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    #[cfg(test)]
    pub(crate) fn rewind(&self, by: Duration) {
        let mut last = self.last.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(earlier) = last.checked_sub(by) {
            *last = earlier;
        }
    }
}

impl Default for ActivityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleDecision {
    KeepRunning,
    /// Timeout reached but another instance owns the proxy.
    NotOwner,
    Shutdown { idle_minutes: u64 },
}

/// Decide one idle tick. `timeout_minutes == 0` never shuts down.
pub fn evaluate(idle_for: Duration, timeout_minutes: u32, owns_proxy: bool) -> IdleDecision {
    if timeout_minutes == 0 {
        return IdleDecision::KeepRunning;
    }
    let idle_minutes = idle_for.as_secs() / 60;
    if idle_minutes < u64::from(timeout_minutes) {
        IdleDecision::KeepRunning
    } else if owns_proxy {
        IdleDecision::Shutdown { idle_minutes }
    } else {
        IdleDecision::NotOwner
    }
}
