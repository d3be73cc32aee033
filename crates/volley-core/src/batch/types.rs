//! Data types for batch processing.

use crate::batch::error::BatchError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use volley_abstraction::{FetchRequest, FetchResponse};

/// Service priority of a batch (higher value = served first).
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BatchPriority {
    /// Background work.
    Low = 1,
    /// Default priority.
    #[default]
    Normal = 2,
    /// Served before normal work.
    High = 3,
    /// Served before everything else.
    Urgent = 4,
}

impl BatchPriority {
    /// All priorities, highest first.
    pub const ALL: [Self; 4] = [Self::Urgent, Self::High, Self::Normal, Self::Low];

    /// Numeric value of the priority (1..=4).
    #[must_use]
    pub fn value(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for BatchPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    /// Queued or waiting on dependencies.
    Pending,
    /// Handed to the processor.
    Running,
    /// Ran to completion (individual requests may still have failed).
    Completed,
    /// Orchestration failure, timeout, or failed dependency.
    Failed,
    /// Cancelled by the caller.
    Cancelled,
    /// Running, but not starting new requests.
    Paused,
}

impl BatchStatus {
    /// Returns `true` for states with no outgoing transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Checks if a batch can move from this state to `to`.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct state transition rule
    pub fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            // From Pending: started, cancelled, or failed by a dependency
            (Self::Pending, Self::Running | Self::Cancelled | Self::Failed) => true,
            // From Running: paused or finished
            (Self::Running, Self::Paused | Self::Completed | Self::Failed | Self::Cancelled) => {
                true
            }
            // From Paused: resumed or finished
            (Self::Paused, Self::Running | Self::Completed | Self::Failed | Self::Cancelled) => {
                true
            }
            // Terminal states are final
            _ => false,
        }
    }
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Progress callback invoked by the manager: `(batch_id, completed, total, current_url)`.
pub type ProgressCallback = Arc<dyn Fn(&str, usize, usize, Option<&str>) + Send + Sync>;

/// Callback invoked once with the final result of a batch.
pub type CompletionCallback = Arc<dyn Fn(&BatchResult) + Send + Sync>;

/// Callback invoked once when a batch ends in `Failed`.
pub type ErrorCallback = Arc<dyn Fn(&BatchError) + Send + Sync>;

/// Outcome of one request inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    /// URL of the request.
    pub url: String,
    /// Status code, when the fetcher produced a response.
    pub status_code: Option<u16>,
    /// Duration of the last attempt.
    pub response_time: Duration,
    /// Bytes downloaded by the successful attempt.
    pub bytes_downloaded: u64,
    /// Number of fetch attempts made.
    pub attempts: u32,
    /// Error message for failed requests.
    pub error: Option<String>,
    /// When the request finished.
    pub completed_at: DateTime<Utc>,
}

impl RequestOutcome {
    /// Builds an outcome from a fetcher response.
    pub fn from_response(response: &FetchResponse, response_time: Duration, attempts: u32) -> Self {
        Self {
            url: response.url.clone(),
            status_code: Some(response.status_code),
            response_time,
            bytes_downloaded: response.bytes_downloaded,
            attempts,
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Builds an outcome for a request that never produced a response.
    pub fn failure(
        url: impl Into<String>,
        error: impl Into<String>,
        response_time: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            url: url.into(),
            status_code: None,
            response_time,
            bytes_downloaded: 0,
            attempts,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    /// Returns `true` when the request produced a 2xx/3xx response.
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.status_code.is_some_and(|code| (200..400).contains(&code))
    }

    /// Human-readable failure reason, if any.
    pub fn failure_reason(&self) -> Option<String> {
        if let Some(error) = &self.error {
            return Some(error.clone());
        }
        match self.status_code {
            Some(code) if !(200..400).contains(&code) => Some(format!("HTTP {}", code)),
            _ => None,
        }
    }
}

/// Accumulated outcome of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchResult {
    /// Batch ID (same as the request ID).
    pub id: String,
    /// Current status.
    pub status: BatchStatus,
    /// Per-request outcomes, in completion order.
    pub results: Vec<RequestOutcome>,
    /// When processing started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the batch reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock time between start and finish.
    pub total_time: Option<Duration>,
    /// Number of requests in the batch.
    pub total_requests: usize,
    /// Requests that produced a 2xx/3xx response.
    pub successful_requests: usize,
    /// Requests that failed.
    pub failed_requests: usize,
    /// Requests that needed more than one attempt.
    pub retried_requests: usize,
    /// Running mean response time of successful requests, in seconds.
    pub average_response_time: f64,
    /// Fastest successful response, in seconds.
    pub min_response_time: Option<f64>,
    /// Slowest successful response, in seconds.
    pub max_response_time: Option<f64>,
    /// Bytes downloaded across all requests.
    pub total_bytes_downloaded: u64,
    /// Error messages, per-request and batch-level.
    pub errors: Vec<String>,
    /// URLs of failed requests.
    pub failed_urls: Vec<String>,
}

impl BatchResult {
    /// Creates an empty pending result.
    pub fn new(id: impl Into<String>, total_requests: usize) -> Self {
        Self {
            id: id.into(),
            status: BatchStatus::Pending,
            results: Vec::new(),
            started_at: None,
            completed_at: None,
            total_time: None,
            total_requests,
            successful_requests: 0,
            failed_requests: 0,
            retried_requests: 0,
            average_response_time: 0.0,
            min_response_time: None,
            max_response_time: None,
            total_bytes_downloaded: 0,
            errors: Vec::new(),
            failed_urls: Vec::new(),
        }
    }

    /// Marks the result as running from now.
    pub fn mark_started(&mut self) {
        self.status = BatchStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Records one finished request.
    #[allow(clippy::suboptimal_flops)] // Keep the running-mean formula as written
    pub fn add_result(&mut self, outcome: RequestOutcome) {
        if outcome.attempts > 1 {
            self.retried_requests += 1;
        }
        self.total_bytes_downloaded += outcome.bytes_downloaded;

        if outcome.is_success() {
            self.successful_requests += 1;
            let secs = outcome.response_time.as_secs_f64();
            let n = self.successful_requests as f64;
            self.average_response_time = (self.average_response_time * (n - 1.0) + secs) / n;
            self.min_response_time = Some(self.min_response_time.map_or(secs, |m| m.min(secs)));
            self.max_response_time = Some(self.max_response_time.map_or(secs, |m| m.max(secs)));
        } else {
            self.failed_requests += 1;
            let reason = outcome.failure_reason().unwrap_or_else(|| "Unknown error".to_string());
            self.errors.push(format!("{}: {}", outcome.url, reason));
            self.failed_urls.push(outcome.url.clone());
        }

        self.results.push(outcome);
    }

    /// Records a batch-level error message.
    pub fn add_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Moves the result into a terminal state and stamps completion times.
    pub fn finalize(&mut self, status: BatchStatus) {
        let now = Utc::now();
        self.status = status;
        self.completed_at = Some(now);
        self.total_time = self.started_at.and_then(|started| (now - started).to_std().ok());
    }

    /// Returns `true` once the batch reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.status.is_terminal()
    }

    /// Share of finished requests that succeeded (0.0 to 1.0).
    pub fn success_rate(&self) -> f64 {
        let finished = self.successful_requests + self.failed_requests;
        if finished == 0 {
            return 0.0;
        }
        self.successful_requests as f64 / finished as f64
    }
}

/// A group of requests submitted and scheduled as one unit.
#[derive(Clone)]
pub struct BatchRequest {
    /// Unique batch ID.
    pub id: String,
    /// Requests to execute; must not be empty.
    pub requests: Vec<FetchRequest>,
    /// Queue priority.
    pub priority: BatchPriority,
    /// Maximum in-flight requests for this batch.
    pub max_concurrent: usize,
    /// Wall-clock budget; `None` uses the configured batch timeout.
    pub timeout: Option<Duration>,
    /// Whether failed requests are retried.
    pub retry_failed: bool,
    /// Batches that must complete successfully before this one runs.
    pub depends_on: Vec<String>,
    /// Caller metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Progress callback, invoked by the manager.
    pub progress_callback: Option<ProgressCallback>,
    /// Completion callback, invoked by the manager.
    pub completion_callback: Option<CompletionCallback>,
    /// Error callback, invoked by the manager.
    pub error_callback: Option<ErrorCallback>,
}

/// Default in-flight request cap for a new batch.
pub const DEFAULT_MAX_CONCURRENT: usize = 10;

impl BatchRequest {
    /// Creates a batch with default settings and a fresh ID.
    ///
    /// # Errors
    /// Returns `BatchError::EmptyBatch` if `requests` is empty.
    pub fn new(requests: Vec<FetchRequest>) -> Result<Self, BatchError> {
        if requests.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        Ok(Self {
            id: format!("batch-{}", uuid::Uuid::new_v4()),
            requests,
            priority: BatchPriority::Normal,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            timeout: None,
            retry_failed: true,
            depends_on: Vec::new(),
            metadata: HashMap::new(),
            created_at: Utc::now(),
            progress_callback: None,
            completion_callback: None,
            error_callback: None,
        })
    }

    /// Creates a batch of GET requests.
    ///
    /// # Errors
    /// Returns `BatchError::EmptyBatch` if `urls` is empty.
    pub fn from_urls<I, S>(urls: I) -> Result<Self, BatchError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(urls.into_iter().map(FetchRequest::get).collect())
    }

    /// Sets the batch ID.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: BatchPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the in-flight request cap.
    #[must_use]
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables retries of failed requests.
    #[must_use]
    pub fn with_retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = retry_failed;
        self
    }

    /// Adds a dependency on another batch.
    #[must_use]
    pub fn depends_on(mut self, batch_id: impl Into<String>) -> Self {
        self.depends_on.push(batch_id.into());
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.completion_callback = Some(callback);
        self
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.error_callback = Some(callback);
        self
    }

    /// Applies submission options on top of the defaults.
    #[must_use]
    pub fn with_options(mut self, options: BatchOptions) -> Self {
        self.priority = options.priority;
        if let Some(max_concurrent) = options.max_concurrent {
            self.max_concurrent = max_concurrent;
        }
        if options.timeout.is_some() {
            self.timeout = options.timeout;
        }
        if let Some(retry_failed) = options.retry_failed {
            self.retry_failed = retry_failed;
        }
        if !options.headers.is_empty() {
            self.requests = self
                .requests
                .into_iter()
                .map(|request| request.with_headers(&options.headers))
                .collect();
        }
        self.depends_on.extend(options.depends_on);
        self.metadata.extend(options.metadata);
        self.progress_callback = options.progress_callback.or(self.progress_callback);
        self.completion_callback = options.completion_callback.or(self.completion_callback);
        self.error_callback = options.error_callback.or(self.error_callback);
        self
    }
}

impl fmt::Debug for BatchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchRequest")
            .field("id", &self.id)
            .field("requests", &self.requests.len())
            .field("priority", &self.priority)
            .field("max_concurrent", &self.max_concurrent)
            .field("timeout", &self.timeout)
            .field("retry_failed", &self.retry_failed)
            .field("depends_on", &self.depends_on)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

/// Per-submission overrides for `submit_urls` / `submit_requests`.
#[derive(Clone, Default)]
pub struct BatchOptions {
    /// Queue priority.
    pub priority: BatchPriority,
    /// In-flight request cap.
    pub max_concurrent: Option<usize>,
    /// Wall-clock budget.
    pub timeout: Option<Duration>,
    /// Whether failed requests are retried.
    pub retry_failed: Option<bool>,
    /// Batches that must complete first.
    pub depends_on: Vec<String>,
    /// Caller metadata.
    pub metadata: HashMap<String, serde_json::Value>,
    /// Headers merged into every request.
    pub headers: HashMap<String, String>,
    /// Progress callback.
    pub progress_callback: Option<ProgressCallback>,
    /// Completion callback.
    pub completion_callback: Option<CompletionCallback>,
    /// Error callback.
    pub error_callback: Option<ErrorCallback>,
}

impl BatchOptions {
    /// Options with every field at its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the priority.
    #[must_use]
    pub fn priority(mut self, priority: BatchPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the in-flight request cap.
    #[must_use]
    pub fn max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = Some(max_concurrent);
        self
    }

    /// Sets the wall-clock budget.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enables or disables retries.
    #[must_use]
    pub fn retry_failed(mut self, retry_failed: bool) -> Self {
        self.retry_failed = Some(retry_failed);
        self
    }

    /// Adds a dependency.
    #[must_use]
    pub fn depends_on(mut self, batch_id: impl Into<String>) -> Self {
        self.depends_on.push(batch_id.into());
        self
    }

    /// Adds a metadata entry.
    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Adds a header applied to every request.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Sets the progress callback.
    #[must_use]
    pub fn on_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn on_complete(mut self, callback: CompletionCallback) -> Self {
        self.completion_callback = Some(callback);
        self
    }

    /// Sets the error callback.
    #[must_use]
    pub fn on_error(mut self, callback: ErrorCallback) -> Self {
        self.error_callback = Some(callback);
        self
    }
}

impl fmt::Debug for BatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchOptions")
            .field("priority", &self.priority)
            .field("max_concurrent", &self.max_concurrent)
            .field("timeout", &self.timeout)
            .field("retry_failed", &self.retry_failed)
            .field("depends_on", &self.depends_on)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok_outcome(url: &str, secs: f64) -> RequestOutcome {
        let response = FetchResponse::new(url, 200, "abcd");
        RequestOutcome::from_response(&response, Duration::from_secs_f64(secs), 1)
    }

    #[test]
    fn test_priority_ordering_and_values() {
        assert!(BatchPriority::Urgent > BatchPriority::High);
        assert!(BatchPriority::High > BatchPriority::Normal);
        assert!(BatchPriority::Normal > BatchPriority::Low);
        assert_eq!(BatchPriority::Low.value(), 1);
        assert_eq!(BatchPriority::Urgent.value(), 4);
        assert_eq!(BatchPriority::default(), BatchPriority::Normal);
        assert_eq!(serde_json::to_string(&BatchPriority::High).unwrap(), "\"high\"");
    }

    #[test]
    fn test_status_transitions() {
        assert!(BatchStatus::Pending.can_transition_to(BatchStatus::Running));
        assert!(BatchStatus::Running.can_transition_to(BatchStatus::Paused));
        assert!(BatchStatus::Paused.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::Pending.can_transition_to(BatchStatus::Paused));
        assert!(!BatchStatus::Completed.can_transition_to(BatchStatus::Running));
        assert!(!BatchStatus::Cancelled.can_transition_to(BatchStatus::Pending));
    }

    #[test]
    fn test_terminal_states() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Failed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(!BatchStatus::Running.is_terminal());
        assert!(!BatchStatus::Paused.is_terminal());
        assert!(!BatchStatus::Pending.is_terminal());
    }

    #[test]
    fn test_batch_request_rejects_empty() {
        let err = BatchRequest::new(vec![]).unwrap_err();
        assert!(matches!(err, BatchError::EmptyBatch));
        assert!(BatchRequest::from_urls(Vec::<String>::new()).is_err());
    }

    #[test]
    fn test_batch_request_defaults() {
        let request = BatchRequest::from_urls(["https://a", "https://b"]).unwrap();
        assert!(request.id.starts_with("batch-"));
        assert_eq!(request.requests.len(), 2);
        assert_eq!(request.priority, BatchPriority::Normal);
        assert_eq!(request.max_concurrent, DEFAULT_MAX_CONCURRENT);
        assert!(request.retry_failed);
        assert!(request.depends_on.is_empty());
    }

    #[test]
    fn test_batch_request_with_options() {
        let options = BatchOptions::new()
            .priority(BatchPriority::Urgent)
            .max_concurrent(3)
            .retry_failed(false)
            .depends_on("batch-x")
            .header("authorization", "token")
            .metadata("source", serde_json::json!("crawler"));

        let request = BatchRequest::from_urls(["https://a"]).unwrap().with_options(options);
        assert_eq!(request.priority, BatchPriority::Urgent);
        assert_eq!(request.max_concurrent, 3);
        assert!(!request.retry_failed);
        assert_eq!(request.depends_on, vec!["batch-x".to_string()]);
        assert_eq!(
            request.requests[0].headers.get("authorization").map(String::as_str),
            Some("token")
        );
        assert_eq!(request.metadata.get("source"), Some(&serde_json::json!("crawler")));
    }

    #[test]
    fn test_add_result_accounting() {
        let mut result = BatchResult::new("batch-1", 3);
        result.mark_started();
        result.add_result(ok_outcome("https://a", 1.0));
        result.add_result(RequestOutcome::failure("https://b", "boom", Duration::ZERO, 3));
        result.add_result(RequestOutcome::from_response(
            &FetchResponse::new("https://c", 404, ""),
            Duration::from_millis(5),
            1,
        ));

        assert_eq!(result.successful_requests, 1);
        assert_eq!(result.failed_requests, 2);
        assert_eq!(result.successful_requests + result.failed_requests, result.results.len());
        assert_eq!(result.retried_requests, 1);
        assert_eq!(result.total_bytes_downloaded, 4);
        assert_eq!(result.failed_urls, vec!["https://b".to_string(), "https://c".to_string()]);
        assert!(result.errors[1].contains("HTTP 404"));
    }

    #[test]
    fn test_running_average_response_time() {
        let mut result = BatchResult::new("batch-1", 3);
        result.add_result(ok_outcome("https://a", 1.0));
        result.add_result(ok_outcome("https://b", 2.0));
        result.add_result(ok_outcome("https://c", 6.0));

        assert!((result.average_response_time - 3.0).abs() < 1e-9);
        assert_eq!(result.min_response_time, Some(1.0));
        assert_eq!(result.max_response_time, Some(6.0));
    }

    #[test]
    fn test_finalize_sets_completion() {
        let mut result = BatchResult::new("batch-1", 1);
        assert!(!result.is_complete());
        result.mark_started();
        result.finalize(BatchStatus::Completed);
        assert!(result.is_complete());
        assert!(result.completed_at.is_some());
        assert!(result.total_time.is_some());
    }
}
