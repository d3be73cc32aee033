//! Configuration for the batch engine.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Immutable configuration shared by the manager, scheduler, and processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchConfig {
    /// Maximum number of batches running at once (default: 5).
    #[serde(default = "default_max_concurrent_batches")]
    pub max_concurrent_batches: usize,

    /// Upper bound on in-flight requests inside one batch (default: 10).
    #[serde(default = "default_max_concurrent_requests_per_batch")]
    pub max_concurrent_requests_per_batch: usize,

    /// Maximum number of batches waiting in the priority queue (default: 1000).
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,

    /// Retries allowed per request after the first attempt (default: 3).
    #[serde(default = "default_max_batch_retries")]
    pub max_batch_retries: u32,

    /// Delay before the first retry in milliseconds (default: 1000).
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Backoff multiplier between retries; 1.0 gives a fixed delay (default: 2.0).
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,

    /// Cap on the retry delay in milliseconds (default: 30000).
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,

    /// Wall-clock budget for a whole batch in milliseconds (default: 300000).
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Budget for one fetch attempt in milliseconds (default: 30000).
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How often the run loop polls when nothing wakes it (default: 100).
    #[serde(default = "default_scheduler_poll_interval_ms")]
    pub scheduler_poll_interval_ms: u64,

    /// Memory ceiling hint for resource-aware admission (default: 1024).
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,

    /// Estimated memory held per queued request (default: 512).
    #[serde(default = "default_estimated_request_memory_kb")]
    pub estimated_request_memory_kb: u64,

    /// CPU ceiling for resource-aware admission, in concurrent-request units (default: 50).
    #[serde(default = "default_max_cpu_units")]
    pub max_cpu_units: usize,

    /// Whether aggregate metrics are recorded.
    #[serde(default = "default_true")]
    pub enable_metrics: bool,

    /// Whether per-batch progress is tracked.
    #[serde(default = "default_true")]
    pub enable_progress_tracking: bool,

    /// Whether terminal results are handed to a persister.
    #[serde(default)]
    pub persist_results: bool,

    /// Directory for the JSON result persister.
    #[serde(default)]
    pub results_dir: Option<PathBuf>,
}

fn default_max_concurrent_batches() -> usize {
    5
}

fn default_max_concurrent_requests_per_batch() -> usize {
    10
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_batch_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_backoff_multiplier() -> f64 {
    2.0
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

fn default_batch_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_scheduler_poll_interval_ms() -> u64 {
    100
}

fn default_memory_limit_mb() -> u64 {
    1024
}

fn default_estimated_request_memory_kb() -> u64 {
    512
}

fn default_max_cpu_units() -> usize {
    50
}

fn default_true() -> bool {
    true
}

/// Errors that can occur during batch configuration validation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BatchConfigError {
    /// Invalid batch concurrency (must be > 0).
    #[error("Invalid max concurrent batches: must be greater than 0")]
    InvalidMaxConcurrentBatches,

    /// Invalid per-batch request concurrency (must be > 0).
    #[error("Invalid max concurrent requests per batch: must be greater than 0")]
    InvalidMaxConcurrentRequests,

    /// Invalid queue size (must be > 0).
    #[error("Invalid max queue size: must be greater than 0")]
    InvalidMaxQueueSize,

    /// Invalid backoff multiplier (must be >= 1.0).
    #[error("Invalid retry backoff multiplier: must be at least 1.0")]
    InvalidBackoffMultiplier,

    /// Invalid timeout (must be > 0).
    #[error("Invalid {0} timeout: must be greater than 0")]
    InvalidTimeout(&'static str),

    /// Invalid poll interval (must be > 0).
    #[error("Invalid scheduler poll interval: must be greater than 0")]
    InvalidPollInterval,

    /// Invalid resource ceiling (must be > 0).
    #[error("Invalid resource limit '{0}': must be greater than 0")]
    InvalidResourceLimit(&'static str),

    /// Persistence enabled without somewhere to write.
    #[error("persist_results requires results_dir or an explicit persister")]
    MissingResultsDir,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_batches: default_max_concurrent_batches(),
            max_concurrent_requests_per_batch: default_max_concurrent_requests_per_batch(),
            max_queue_size: default_max_queue_size(),
            max_batch_retries: default_max_batch_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff_multiplier: default_retry_backoff_multiplier(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
            batch_timeout_ms: default_batch_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            scheduler_poll_interval_ms: default_scheduler_poll_interval_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            estimated_request_memory_kb: default_estimated_request_memory_kb(),
            max_cpu_units: default_max_cpu_units(),
            enable_metrics: true,
            enable_progress_tracking: true,
            persist_results: false,
            results_dir: None,
        }
    }
}

impl BatchConfig {
    /// Validate the batch configuration.
    ///
    /// `persist_results` without a `results_dir` is not rejected here: the
    /// manager builder checks it, since a persister may be supplied directly.
    ///
    /// # Errors
    /// Returns `BatchConfigError` if any configuration value is invalid.
    pub fn validate(&self) -> Result<(), BatchConfigError> {
        if self.max_concurrent_batches == 0 {
            return Err(BatchConfigError::InvalidMaxConcurrentBatches);
        }

        if self.max_concurrent_requests_per_batch == 0 {
            return Err(BatchConfigError::InvalidMaxConcurrentRequests);
        }

        if self.max_queue_size == 0 {
            return Err(BatchConfigError::InvalidMaxQueueSize);
        }

        if !(self.retry_backoff_multiplier >= 1.0 && self.retry_backoff_multiplier.is_finite()) {
            return Err(BatchConfigError::InvalidBackoffMultiplier);
        }

        if self.batch_timeout_ms == 0 {
            return Err(BatchConfigError::InvalidTimeout("batch"));
        }

        if self.request_timeout_ms == 0 {
            return Err(BatchConfigError::InvalidTimeout("request"));
        }

        if self.scheduler_poll_interval_ms == 0 {
            return Err(BatchConfigError::InvalidPollInterval);
        }

        if self.memory_limit_mb == 0 {
            return Err(BatchConfigError::InvalidResourceLimit("memory_limit_mb"));
        }

        if self.max_cpu_units == 0 {
            return Err(BatchConfigError::InvalidResourceLimit("max_cpu_units"));
        }

        Ok(())
    }

    /// Get the batch timeout as a Duration.
    #[must_use]
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    /// Get the per-request timeout as a Duration.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Get the scheduler poll interval as a Duration.
    #[must_use]
    pub fn scheduler_poll_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_poll_interval_ms)
    }

    /// Build the retry policy described by this configuration.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_batch_retries,
            Duration::from_millis(self.retry_delay_ms),
            Duration::from_millis(self.max_retry_delay_ms),
            self.retry_backoff_multiplier,
        )
    }
}

/// Per-request retry budget and delay schedule, derived from [`BatchConfig`].
///
/// A request is attempted once, then retried up to `max_retries` times. With a
/// multiplier of 1.0 every retry waits `initial_delay`; above that the wait grows
/// geometrically until it reaches `max_delay`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (`max_batch_retries`).
    pub max_retries: u32,
    /// Wait before the first retry (`retry_delay_ms`).
    pub initial_delay: Duration,
    /// Ceiling on any single wait (`max_retry_delay_ms`).
    pub max_delay: Duration,
    /// Growth factor per retry (`retry_backoff_multiplier`).
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        BatchConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay,
            multiplier,
        }
    }

    /// Wait before retry number `retries_used + 1`.
    pub fn calculate_delay(&self, retries_used: u32) -> Duration {
        if self.multiplier <= 1.0 {
            return self.initial_delay.min(self.max_delay);
        }
        let growth = self.multiplier.powi(i32::try_from(retries_used).unwrap_or(i32::MAX));
        let scaled_ms = self.initial_delay.as_millis() as f64 * growth;
        if !scaled_ms.is_finite() || scaled_ms >= self.max_delay.as_millis() as f64 {
            return self.max_delay;
        }
        Duration::from_millis(scaled_ms as u64)
    }
}
