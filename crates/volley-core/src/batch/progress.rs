//! Progress tracking for running batches.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// Live progress of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchProgress {
    /// Batch ID.
    pub batch_id: String,
    /// Total number of requests in the batch.
    pub total_requests: usize,
    /// Requests finished so far (successful or failed).
    pub completed_requests: usize,
    /// Finished requests that failed.
    pub failed_requests: usize,
    /// URL of the most recently finished request.
    pub current_request: Option<String>,
    /// When the batch started running.
    pub started_at: Option<DateTime<Utc>>,
    /// Linear extrapolation of the finish time from current throughput.
    pub estimated_completion: Option<DateTime<Utc>>,
}

impl BatchProgress {
    /// Create a new progress tracker.
    pub fn new(batch_id: impl Into<String>, total_requests: usize) -> Self {
        Self {
            batch_id: batch_id.into(),
            total_requests,
            completed_requests: 0,
            failed_requests: 0,
            current_request: None,
            started_at: None,
            estimated_completion: None,
        }
    }

    /// Mark the batch as started now.
    pub fn start(&mut self) {
        self.started_at = Some(Utc::now());
    }

    /// Update progress with a completion event.
    pub fn update(&mut self, completed: usize, failed: usize, current_request: Option<&str>) {
        self.completed_requests = completed;
        self.failed_requests = failed;
        if let Some(url) = current_request {
            self.current_request = Some(url.to_string());
        }
        self.estimated_completion = self.estimate_completion(Utc::now());
    }

    /// Estimate the completion time as of `now`.
    ///
    /// Returns `None` until at least one request finished.
    pub fn estimate_completion(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let started = self.started_at?;
        if self.completed_requests == 0 {
            return None;
        }

        let elapsed = (now - started).to_std().ok()?;
        let per_request = elapsed.div_f64(self.completed_requests as f64);
        let remaining = self.total_requests.saturating_sub(self.completed_requests);
        let eta = per_request.mul_f64(remaining as f64);

        chrono::Duration::from_std(eta).ok().map(|eta| now + eta)
    }

    /// Requests not yet finished.
    pub fn remaining(&self) -> usize {
        self.total_requests.saturating_sub(self.completed_requests)
    }

    /// Get completion percentage.
    pub fn percentage(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        (self.completed_requests as f64 / self.total_requests as f64) * 100.0
    }

    /// Time left until the estimated completion, formatted like "2m 15s".
    pub fn eta_display(&self) -> String {
        let Some(estimated) = self.estimated_completion else {
            return "calculating...".to_string();
        };
        let left = (estimated - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        format_eta(left)
    }
}

/// Compact ETA text: `1h 02m`, `2m 15s`, or `9s`.
fn format_eta(left: Duration) -> String {
    match left.as_secs() {
        secs @ 3600.. => format!("{}h {:02}m", secs / 3600, secs % 3600 / 60),
        secs @ 60.. => format!("{}m {}s", secs / 60, secs % 60),
        secs => format!("{secs}s"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_new() {
        let progress = BatchProgress::new("batch-1", 100);
        assert_eq!(progress.total_requests, 100);
        assert_eq!(progress.completed_requests, 0);
        assert_eq!(progress.remaining(), 100);
        assert!(progress.estimated_completion.is_none());
        assert_eq!(progress.eta_display(), "calculating...");
    }

    #[test]
    fn test_progress_update() {
        let mut progress = BatchProgress::new("batch-1", 100);
        progress.start();
        progress.update(45, 3, Some("https://example.com/45"));
        assert_eq!(progress.completed_requests, 45);
        assert_eq!(progress.failed_requests, 3);
        assert_eq!(progress.remaining(), 55);
        assert_eq!(progress.current_request.as_deref(), Some("https://example.com/45"));
        assert!(progress.estimated_completion.is_some());
    }

    #[test]
    fn test_estimate_is_linear() {
        let mut progress = BatchProgress::new("batch-1", 10);
        let started = Utc::now();
        progress.started_at = Some(started);
        progress.completed_requests = 2;

        // 2 requests in 4s -> 2s each -> 8 remaining = 16s after `now`
        let now = started + chrono::Duration::seconds(4);
        let estimated = progress.estimate_completion(now).unwrap();
        assert_eq!((estimated - now).num_seconds(), 16);
    }

    #[test]
    fn test_percentage() {
        let mut progress = BatchProgress::new("batch-1", 100);
        progress.completed_requests = 45;
        assert!((progress.percentage() - 45.0).abs() < 0.1);
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(Duration::from_secs(3_725)), "1h 02m");
        assert_eq!(format_eta(Duration::from_secs(135)), "2m 15s");
        assert_eq!(format_eta(Duration::from_millis(9_900)), "9s");
    }
}
