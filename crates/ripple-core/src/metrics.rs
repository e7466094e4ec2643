//! Process-wide cascade counters.
//!
//! Incremented by the execution engine; [`Metrics::flush`] emits them as a
//! single `info!` record when an execution reaches a terminal state.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    cascades_started: AtomicU64,
    steps_completed: AtomicU64,
    steps_failed: AtomicU64,
    steps_skipped: AtomicU64,
    ci_polls: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cascades_started: u64,
    pub steps_completed: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub ci_polls: u64,
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            cascades_started: AtomicU64::new(0),
            steps_completed: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            ci_polls: AtomicU64::new(0),
        }
    }

    fn bump(counter: &AtomicU64, name: &'static str) {
        counter.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = name, "counter incremented");
    }

    pub fn inc_cascades_started(&self) {
        Self::bump(&self.cascades_started, "cascades_started");
    }

    pub fn inc_steps_completed(&self) {
        Self::bump(&self.steps_completed, "steps_completed");
    }

    pub fn inc_steps_failed(&self) {
        Self::bump(&self.steps_failed, "steps_failed");
    }

    pub fn inc_steps_skipped(&self) {
        Self::bump(&self.steps_skipped, "steps_skipped");
    }

    pub fn inc_ci_polls(&self) {
        Self::bump(&self.ci_polls, "ci_polls");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cascades_started: self.cascades_started.load(Ordering::Relaxed),
            steps_completed: self.steps_completed.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            ci_polls: self.ci_polls.load(Ordering::Relaxed),
        }
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        let s = self.snapshot();
        tracing::info!(
            metric = "flush",
            cascades_started = s.cascades_started,
            steps_completed = s.steps_completed,
            steps_failed = s.steps_failed,
            steps_skipped = s.steps_skipped,
            ci_polls = s.ci_polls,
        );
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        for counter in [
            &self.cascades_started,
            &self.steps_completed,
            &self.steps_failed,
            &self.steps_skipped,
            &self.ci_polls,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_cascades_started();
        m.inc_steps_completed();
        m.inc_steps_completed();
        m.inc_steps_failed();
        m.inc_ci_polls();
        let s = m.snapshot();
        assert_eq!(s.cascades_started, 1);
        assert_eq!(s.steps_completed, 2);
        assert_eq!(s.steps_failed, 1);
        assert_eq!(s.steps_skipped, 0);
        assert_eq!(s.ci_polls, 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_steps_skipped();
        m.inc_ci_polls();
        m.reset();
        assert_eq!(m.snapshot(), MetricsSnapshot::default());
    }
}
