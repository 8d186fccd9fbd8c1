#[cfg(test)]
#[path = "tests/metric.rs"]
mod tests;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::config::ProxyErrorMetricParams;

/// Per-host error counter.
#[derive(Debug, Default)]
pub struct Metric {
    errors: AtomicU64,
}

impl Metric {
    pub fn increment(&self) {
        let _ = self
            .errors
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                Some(count.saturating_add(1))
            });
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Acquire)
    }

    /// Returns the count accumulated since the last snapshot and starts a new
    /// interval at zero.
    pub fn snapshot_and_reset(&self) -> u64 {
        self.errors.swap(0, Ordering::AcqRel)
    }
}

/// Sliding window of call outcomes towards one host, used to detect a
/// target that a proxying peer keeps failing to reach.
#[derive(Debug)]
pub struct ProxyErrorTracker {
    params: ProxyErrorMetricParams,
    outcomes: Mutex<VecDeque<bool>>,
}

impl ProxyErrorTracker {
    #[must_use]
    pub fn new(params: ProxyErrorMetricParams) -> Self {
        Self {
            outcomes: Mutex::new(VecDeque::with_capacity(params.window)),
            params,
        }
    }

    /// Records an outcome. Returns `true` when `failed` and the window is
    /// full with a failure ratio above the cutoff.
    pub fn record(&self, failed: bool) -> bool {
        let window = self.params.window;
        if window == 0 {
            return false;
        }

        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(failed);
        while outcomes.len() > window {
            let _ = outcomes.pop_front();
        }

        failed && outcomes.len() == window && ratio(&outcomes) > self.params.cutoff
    }

    #[must_use]
    pub fn failure_ratio(&self) -> f64 {
        ratio(&self.outcomes.lock())
    }
}

#[expect(
    clippy::cast_precision_loss,
    reason = "window sizes are far below f64 precision"
)]
fn ratio(outcomes: &VecDeque<bool>) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }

    let failures = outcomes.iter().filter(|failed| **failed).count();

    failures as f64 / outcomes.len() as f64
}
