//! Process-wide batch metrics.

use crate::batch::types::{BatchResult, BatchStatus};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Aggregate counters across every batch a manager has seen.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchMetrics {
    /// Batches ever submitted.
    pub total_batches: u64,
    /// Batches pending in the queue or waiting on dependencies.
    pub queued_batches: u64,
    /// Batches running or paused.
    pub running_batches: u64,
    /// Batches that completed.
    pub completed_batches: u64,
    /// Batches that failed.
    pub failed_batches: u64,
    /// Batches that were cancelled.
    pub cancelled_batches: u64,
    /// Requests across finished batches.
    pub total_requests: u64,
    /// Successful requests across finished batches.
    pub successful_requests: u64,
    /// Failed requests across finished batches.
    pub failed_requests: u64,
    /// Successful share of finished requests (0.0 to 1.0).
    pub success_rate: f64,
    /// Mean wall-clock time of finished batches, in seconds.
    pub average_batch_time_secs: f64,
    /// Mean response time of successful requests, in seconds.
    pub average_response_time_secs: f64,
    /// Seconds since the manager was created.
    pub uptime_secs: f64,
    /// Finished batches that actually ran, the denominator of `average_batch_time_secs`.
    #[serde(skip)]
    timed_batches: u64,
}

impl BatchMetrics {
    fn record_submitted(&mut self) {
        self.total_batches += 1;
        self.queued_batches += 1;
    }

    fn record_withdrawn(&mut self) {
        self.total_batches = self.total_batches.saturating_sub(1);
        self.queued_batches = self.queued_batches.saturating_sub(1);
    }

    fn record_started(&mut self) {
        self.queued_batches = self.queued_batches.saturating_sub(1);
        self.running_batches += 1;
    }

    #[allow(clippy::suboptimal_flops)]
    fn record_finished(&mut self, result: &BatchResult, was_running: bool) {
        if was_running {
            self.running_batches = self.running_batches.saturating_sub(1);
        } else {
            self.queued_batches = self.queued_batches.saturating_sub(1);
        }

        match result.status {
            BatchStatus::Completed => self.completed_batches += 1,
            BatchStatus::Failed => self.failed_batches += 1,
            BatchStatus::Cancelled => self.cancelled_batches += 1,
            _ => {}
        }

        if let Some(total_time) = result.total_time {
            self.timed_batches += 1;
            let n = self.timed_batches as f64;
            self.average_batch_time_secs =
                (self.average_batch_time_secs * (n - 1.0) + total_time.as_secs_f64()) / n;
        }

        let previous_successes = self.successful_requests as f64;
        let new_successes = result.successful_requests as u64;
        self.total_requests += result.total_requests as u64;
        self.successful_requests += new_successes;
        self.failed_requests += result.failed_requests as u64;

        if new_successes > 0 {
            self.average_response_time_secs = (self.average_response_time_secs * previous_successes
                + result.average_response_time * new_successes as f64)
                / self.successful_requests as f64;
        }

        let attempted = self.successful_requests + self.failed_requests;
        if attempted > 0 {
            self.success_rate = self.successful_requests as f64 / attempted as f64;
        }
    }
}

/// Thread-safe recorder owned by the manager.
///
/// Does nothing when metrics are disabled; uptime is still reported.
#[derive(Debug)]
pub(crate) struct MetricsRecorder {
    enabled: bool,
    created: Instant,
    metrics: Mutex<BatchMetrics>,
}

impl MetricsRecorder {
    pub(crate) fn new(enabled: bool) -> Self {
        Self {
            enabled,
            created: Instant::now(),
            metrics: Mutex::new(BatchMetrics::default()),
        }
    }

    pub(crate) fn record_submitted(&self) {
        if self.enabled {
            self.metrics.lock().record_submitted();
        }
    }

    /// Reverses `record_submitted` for a submission the scheduler rejected.
    pub(crate) fn record_withdrawn(&self) {
        if self.enabled {
            self.metrics.lock().record_withdrawn();
        }
    }

    pub(crate) fn record_started(&self) {
        if self.enabled {
            self.metrics.lock().record_started();
        }
    }

    pub(crate) fn record_finished(&self, result: &BatchResult, was_running: bool) {
        if self.enabled {
            self.metrics.lock().record_finished(result, was_running);
        }
    }

    pub(crate) fn snapshot(&self) -> BatchMetrics {
        let mut snapshot = self.metrics.lock().clone();
        snapshot.uptime_secs = self.created.elapsed().as_secs_f64();
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::RequestOutcome;
    use std::time::Duration;
    use volley_abstraction::FetchResponse;

    fn finished(
        id: &str,
        status: BatchStatus,
        response_secs: &[f64],
        failures: usize,
    ) -> BatchResult {
        let mut result = BatchResult::new(id, response_secs.len() + failures);
        result.mark_started();
        for (i, secs) in response_secs.iter().enumerate() {
            let response = FetchResponse::new(format!("https://ok/{i}"), 200, "");
            let elapsed = Duration::from_secs_f64(*secs);
            result.add_result(RequestOutcome::from_response(&response, elapsed, 1));
        }
        for i in 0..failures {
            let url = format!("https://bad/{i}");
            result.add_result(RequestOutcome::failure(url, "refused", Duration::ZERO, 1));
        }
        result.finalize(status);
        result
    }

    #[test]
    fn test_lifecycle_counts() {
        let recorder = MetricsRecorder::new(true);
        recorder.record_submitted();
        recorder.record_submitted();
        recorder.record_started();

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_batches, 2);
        assert_eq!(snapshot.queued_batches, 1);
        assert_eq!(snapshot.running_batches, 1);

        recorder.record_finished(&finished("a", BatchStatus::Completed, &[1.0], 1), true);
        recorder.record_finished(&finished("b", BatchStatus::Cancelled, &[], 0), false);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.queued_batches, 0);
        assert_eq!(snapshot.running_batches, 0);
        assert_eq!(snapshot.completed_batches, 1);
        assert_eq!(snapshot.cancelled_batches, 1);
        assert_eq!(snapshot.successful_requests, 1);
        assert_eq!(snapshot.failed_requests, 1);
        assert!((snapshot.success_rate - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_response_time_is_weighted_by_successes() {
        let recorder = MetricsRecorder::new(true);
        recorder.record_finished(&finished("a", BatchStatus::Completed, &[1.0, 1.0, 1.0], 0), true);
        recorder.record_finished(&finished("b", BatchStatus::Completed, &[5.0], 0), true);

        // (1+1+1+5) / 4
        let snapshot = recorder.snapshot();
        assert!((snapshot.average_response_time_secs - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_disabled_recorder_stays_zero() {
        let recorder = MetricsRecorder::new(false);
        recorder.record_submitted();
        recorder.record_finished(&finished("a", BatchStatus::Failed, &[1.0], 0), true);

        let snapshot = recorder.snapshot();
        assert_eq!(snapshot.total_batches, 0);
        assert_eq!(snapshot.failed_batches, 0);
        assert!(snapshot.uptime_secs >= 0.0);
    }
}
