use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::errors::WorkflowError;

/// Workflow action counters
#[derive(Debug, Default)]
pub struct WorkflowMetrics {
    pub actions_applied: AtomicU64,
    pub replays: AtomicU64,
    pub conflicts: AtomicU64,
    pub rejections: AtomicU64,
    pub timeouts: AtomicU64,
    pub evaluations_submitted: AtomicU64,
    pub finalizations: AtomicU64,
}

impl WorkflowMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_applied(&self) {
        self.actions_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evaluation_submitted(&self) {
        self.evaluations_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_finalization(&self) {
        self.finalizations.fetch_add(1, Ordering::Relaxed);
    }

    /// Buckets a failed action by kind.
    pub fn record_error(&self, error: &WorkflowError) {
        let counter = match error {
            WorkflowError::ConcurrentModification { .. } => &self.conflicts,
            WorkflowError::Timeout { .. } => &self.timeouts,
            _ => &self.rejections,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_stats(&self) -> WorkflowStats {
        WorkflowStats {
            actions_applied: self.actions_applied.load(Ordering::Relaxed),
            replays: self.replays.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            evaluations_submitted: self.evaluations_submitted.load(Ordering::Relaxed),
            finalizations: self.finalizations.load(Ordering::Relaxed),
        }
    }

    pub fn log_stats(&self) {
        let stats = self.get_stats();
        info!(
            "Workflow metrics: applied={}, replays={}, conflicts={}, rejections={}, timeouts={}, evaluations_submitted={}, finalizations={}",
            stats.actions_applied,
            stats.replays,
            stats.conflicts,
            stats.rejections,
            stats.timeouts,
            stats.evaluations_submitted,
            stats.finalizations
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkflowStats {
    pub actions_applied: u64,
    pub replays: u64,
    pub conflicts: u64,
    pub rejections: u64,
    pub timeouts: u64,
    pub evaluations_submitted: u64,
    pub finalizations: u64,
}

/// Time an operation and log its duration
pub struct OperationTimer {
    operation: &'static str,
    start: Instant,
}

impl OperationTimer {
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }

    pub fn finish(self) -> Duration {
        let duration = self.start.elapsed();
        debug!(
            operation = %self.operation,
            duration_ms = duration.as_millis() as u64,
            "Operation completed"
        );
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_are_bucketed_by_kind() {
        let metrics = WorkflowMetrics::new();
        metrics.record_error(&WorkflowError::ConcurrentModification {
            proposal_id: "p1".to_string(),
            expected: 1,
            actual: 2,
        });
        metrics.record_error(&WorkflowError::unauthorized("no"));
        metrics.record_error(&WorkflowError::precondition("no"));
        metrics.record_applied();

        let stats = metrics.get_stats();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.rejections, 2);
        assert_eq!(stats.timeouts, 0);
        assert_eq!(stats.actions_applied, 1);
    }
}
