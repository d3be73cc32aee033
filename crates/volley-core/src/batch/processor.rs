//! Executes the requests of one batch with bounded concurrency.

use crate::batch::config::{BatchConfig, RetryPolicy};
use crate::batch::error::BatchError;
use crate::batch::types::{BatchRequest, BatchResult, BatchStatus, RequestOutcome};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use volley_abstraction::{FetchError, FetchRequest, Fetcher};

/// Per-request callback: `(outcome, completed, failed)`.
///
/// Fires once for every outcome the batch result accepted. `completed` counts
/// every finished request, failed ones included.
pub type RequestProgressCallback = Arc<dyn Fn(&RequestOutcome, usize, usize) + Send + Sync>;

/// Cancellation and pause signals for one batch.
#[derive(Clone)]
pub(crate) struct BatchControl {
    cancel: CancellationToken,
    pause: Arc<watch::Sender<bool>>,
}

impl BatchControl {
    fn new() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            pause: Arc::new(pause),
        }
    }

    /// Blocks while the batch is paused. Returns `false` once cancelled.
    async fn checkpoint(&self) -> bool {
        let mut paused = self.pause.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            if !*paused.borrow_and_update() {
                return true;
            }
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                changed = paused.changed() => {
                    if changed.is_err() {
                        return !self.cancel.is_cancelled();
                    }
                }
            }
        }
    }
}

/// Shared accumulator for concurrently finishing requests.
///
/// Once closed, late completions are dropped.
struct ResultAccumulator {
    result: Mutex<Option<BatchResult>>,
}

impl ResultAccumulator {
    fn new(result: BatchResult) -> Self {
        Self {
            result: Mutex::new(Some(result)),
        }
    }

    /// Records an outcome and returns `(completed, failed)` after it.
    fn record(&self, outcome: RequestOutcome) -> Option<(usize, usize)> {
        let mut guard = self.result.lock();
        let result = guard.as_mut()?;
        result.add_result(outcome);
        Some((result.successful_requests + result.failed_requests, result.failed_requests))
    }

    fn close(&self) -> Option<BatchResult> {
        self.result.lock().take()
    }
}

/// Everything a request unit needs, shared across the batch.
struct UnitContext {
    batch_id: String,
    control: BatchControl,
    semaphore: Arc<Semaphore>,
    fetcher: Arc<dyn Fetcher>,
    retry: Option<RetryPolicy>,
    request_timeout: Duration,
    accumulator: ResultAccumulator,
    progress: Option<RequestProgressCallback>,
}

impl UnitContext {
    fn record(&self, outcome: RequestOutcome) {
        let reported = self.progress.as_ref().map(|_| outcome.clone());
        let Some((completed, failed)) = self.accumulator.record(outcome) else {
            debug!(batch_id = %self.batch_id, "Dropping late result");
            return;
        };
        if let (Some(callback), Some(outcome)) = (&self.progress, reported) {
            callback(&outcome, completed, failed);
        }
    }
}

/// Runs one request: pause/cancel checkpoint, gate, fetch, retries.
async fn run_unit(ctx: Arc<UnitContext>, request: FetchRequest) {
    if !ctx.control.checkpoint().await {
        return;
    }

    let _permit = tokio::select! {
        () = ctx.control.cancel.cancelled() => return,
        permit = Arc::clone(&ctx.semaphore).acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return,
        },
    };

    // A pause may have been requested while waiting for the gate
    if !ctx.control.checkpoint().await {
        return;
    }

    let timeout = request.timeout.unwrap_or(ctx.request_timeout);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let started = Instant::now();
        let fetched = tokio::time::timeout(timeout, ctx.fetcher.fetch(&request)).await;
        let elapsed = started.elapsed();

        let error = match fetched {
            Ok(Ok(response)) => {
                debug!(
                    batch_id = %ctx.batch_id,
                    url = %request.url,
                    status = response.status_code,
                    attempts,
                    "Request finished"
                );
                ctx.record(RequestOutcome::from_response(&response, elapsed, attempts));
                return;
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => FetchError::Timeout(timeout).to_string(),
        };

        let Some(policy) = &ctx.retry else {
            ctx.record(RequestOutcome::failure(&request.url, error, elapsed, attempts));
            return;
        };

        let retries_used = attempts - 1;
        if retries_used >= policy.max_retries {
            warn!(batch_id = %ctx.batch_id, url = %request.url, attempts, "Retry budget exhausted");
            let message = format!("max retries exceeded ({} attempts): {}", attempts, error);
            ctx.record(RequestOutcome::failure(&request.url, message, elapsed, attempts));
            return;
        }

        let delay = policy.calculate_delay(retries_used);
        debug!(
            batch_id = %ctx.batch_id,
            url = %request.url,
            retry = attempts,
            delay_ms = delay.as_millis(),
            error = %error,
            "Retrying after backoff"
        );

        tokio::select! {
            () = ctx.control.cancel.cancelled() => return,
            () = tokio::time::sleep(delay) => {}
        }
        if !ctx.control.checkpoint().await {
            return;
        }
    }
}

/// Waits for every unit. A panicking unit fails the orchestration.
async fn drain(units: &mut JoinSet<()>) -> Result<(), String> {
    while let Some(joined) = units.join_next().await {
        if let Err(err) = joined
            && err.is_panic()
        {
            return Err(panic_message(err.into_panic()));
        }
    }
    Ok(())
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Executes batches against a `Fetcher`.
///
/// Each request runs as its own task behind a per-batch semaphore. Batches can be
/// cancelled, paused, and resumed by ID while they run.
pub struct BatchProcessor {
    config: Arc<BatchConfig>,
    fetcher: Arc<dyn Fetcher>,
    controls: RwLock<HashMap<String, BatchControl>>,
}

impl BatchProcessor {
    /// Create a new processor.
    pub fn new(config: Arc<BatchConfig>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            controls: RwLock::new(HashMap::new()),
        }
    }

    /// Registers control signals for a batch ahead of processing.
    ///
    /// Lets a cancel or pause issued between scheduling and execution take effect.
    pub fn register(&self, batch_id: &str) {
        self.control(batch_id);
    }

    fn control(&self, batch_id: &str) -> BatchControl {
        self.controls
            .write()
            .entry(batch_id.to_string())
            .or_insert_with(BatchControl::new)
            .clone()
    }

    pub(crate) fn forget(&self, batch_id: &str) {
        self.controls.write().remove(batch_id);
    }

    /// Process every request of `batch` and return the finalized result.
    ///
    /// Individual request failures never fail the batch. The batch ends `Failed`
    /// only on timeout or when the orchestration itself breaks, and `Cancelled`
    /// when cancellation is observed first.
    pub async fn process_batch(
        &self,
        batch: &BatchRequest,
        progress: Option<RequestProgressCallback>,
    ) -> BatchResult {
        let control = self.control(&batch.id);
        let mut result = BatchResult::new(&batch.id, batch.requests.len());
        result.mark_started();

        if batch.requests.is_empty() {
            result.finalize(BatchStatus::Completed);
            self.forget(&batch.id);
            return result;
        }

        if control.cancel.is_cancelled() {
            result.add_error(BatchError::Cancelled.to_string());
            result.finalize(BatchStatus::Cancelled);
            self.forget(&batch.id);
            return result;
        }

        let concurrency =
            batch.max_concurrent.min(self.config.max_concurrent_requests_per_batch).max(1);
        let batch_timeout = batch.timeout.unwrap_or_else(|| self.config.batch_timeout());

        info!(
            batch_id = %batch.id,
            requests = batch.requests.len(),
            concurrency,
            timeout_ms = batch_timeout.as_millis(),
            "Processing batch"
        );

        let ctx = Arc::new(UnitContext {
            batch_id: batch.id.clone(),
            control: control.clone(),
            semaphore: Arc::new(Semaphore::new(concurrency)),
            fetcher: Arc::clone(&self.fetcher),
            retry: batch.retry_failed.then(|| self.config.retry_policy()),
            request_timeout: self.config.request_timeout(),
            accumulator: ResultAccumulator::new(result),
            progress,
        });

        let mut units = JoinSet::new();
        for request in &batch.requests {
            units.spawn(run_unit(Arc::clone(&ctx), request.clone()));
        }

        let (status, error) = tokio::select! {
            drained = drain(&mut units) => match drained {
                Ok(()) if control.cancel.is_cancelled() => {
                    (BatchStatus::Cancelled, Some(BatchError::Cancelled.to_string()))
                }
                Ok(()) => (BatchStatus::Completed, None),
                Err(panic) => {
                    (BatchStatus::Failed, Some(BatchError::Execution(panic).to_string()))
                }
            },
            () = control.cancel.cancelled() => {
                (BatchStatus::Cancelled, Some(BatchError::Cancelled.to_string()))
            }
            () = tokio::time::sleep(batch_timeout) => {
                (BatchStatus::Failed, Some(BatchError::Timeout(batch_timeout).to_string()))
            }
        };

        // Abandon whatever is still in flight; the accumulator refuses late results.
        let mut result = ctx
            .accumulator
            .close()
            .unwrap_or_else(|| BatchResult::new(&batch.id, batch.requests.len()));
        units.abort_all();

        if let Some(error) = error {
            result.add_error(error);
        }
        result.finalize(status);
        self.forget(&batch.id);

        info!(
            batch_id = %batch.id,
            status = %status,
            successful = result.successful_requests,
            failed = result.failed_requests,
            "Batch processed"
        );
        result
    }

    /// Signals cancellation to a registered batch.
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        self.controls.read().get(batch_id).is_some_and(|control| {
            control.cancel.cancel();
            true
        })
    }

    /// Stops a batch from starting new requests. In-flight requests finish.
    pub fn pause_batch(&self, batch_id: &str) -> bool {
        self.controls.read().get(batch_id).is_some_and(|control| {
            control.pause.send_replace(true);
            true
        })
    }

    /// Lets a paused batch continue.
    pub fn resume_batch(&self, batch_id: &str) -> bool {
        self.controls.read().get(batch_id).is_some_and(|control| {
            control.pause.send_replace(false);
            true
        })
    }

    /// Returns `true` if the batch is registered and paused.
    pub fn is_paused(&self, batch_id: &str) -> bool {
        self.controls.read().get(batch_id).is_some_and(|control| *control.pause.borrow())
    }

    /// IDs of registered batches.
    pub fn active_batches(&self) -> Vec<String> {
        self.controls.read().keys().cloned().collect()
    }

    /// Cancels every registered batch and returns how many were signalled.
    pub fn cancel_all(&self) -> usize {
        let controls = self.controls.read();
        for control in controls.values() {
            control.cancel.cancel();
        }
        controls.len()
    }
}

impl fmt::Debug for BatchProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchProcessor")
            .field("config", &self.config)
            .field(
                "active_batches",
                &self.controls.try_read().map(|c| c.len()).unwrap_or(0),
            )
            .finish_non_exhaustive()
    }
}
