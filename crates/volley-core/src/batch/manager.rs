//! Public entry point of the batch engine.
//!
//! [`BatchManager`] accepts submissions, tracks per-batch state, and owns the
//! background run loop that moves batches from the scheduler into the processor.

use crate::batch::config::{BatchConfig, BatchConfigError};
use crate::batch::error::{BatchError, Result};
use crate::batch::metrics::{BatchMetrics, MetricsRecorder};
use crate::batch::persistence::{JsonFilePersister, ResultPersister};
use crate::batch::processor::{BatchProcessor, RequestProgressCallback, panic_message};
use crate::batch::progress::BatchProgress;
use crate::batch::queue::{PriorityStrategy, StrictPriority};
use crate::batch::scheduler::{
    AdmissionPolicy, BatchScheduler, ConcurrencyAdmission, FailedDependency, Scheduled,
    SchedulerStatistics,
};
use crate::batch::types::{
    BatchOptions, BatchPriority, BatchRequest, BatchResult, BatchStatus, RequestOutcome,
};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use volley_abstraction::{FetchRequest, Fetcher};

/// One row of [`BatchManager::list_active_batches`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    /// Batch ID.
    pub id: String,
    /// Current status.
    pub status: BatchStatus,
    /// Queue priority.
    pub priority: BatchPriority,
    /// Number of requests.
    pub total_requests: usize,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

struct TrackedBatch {
    request: Arc<BatchRequest>,
    status: BatchStatus,
    result: BatchResult,
    progress: Option<BatchProgress>,
    // Set once no processing path touches the entry again.
    settled: bool,
}

struct RunLoop {
    shutdown: CancellationToken,
    handle: JoinHandle<()>,
}

struct ManagerInner {
    config: Arc<BatchConfig>,
    processor: BatchProcessor,
    scheduler: BatchScheduler,
    batches: RwLock<HashMap<String, TrackedBatch>>,
    metrics: MetricsRecorder,
    persister: Option<Arc<dyn ResultPersister>>,
    wake: Notify,
    run_loop: Mutex<Option<RunLoop>>,
    tasks: TaskTracker,
}

/// Builder for [`BatchManager`].
pub struct BatchManagerBuilder {
    config: BatchConfig,
    fetcher: Arc<dyn Fetcher>,
    persister: Option<Arc<dyn ResultPersister>>,
    admission: Option<Arc<dyn AdmissionPolicy>>,
    strategy: Option<Arc<dyn PriorityStrategy>>,
}

impl BatchManagerBuilder {
    /// Sends every terminal result to `persister`.
    #[must_use]
    pub fn persister(mut self, persister: Arc<dyn ResultPersister>) -> Self {
        self.persister = Some(persister);
        self
    }

    /// Replaces the default concurrency-only admission policy.
    #[must_use]
    pub fn admission(mut self, admission: Arc<dyn AdmissionPolicy>) -> Self {
        self.admission = Some(admission);
        self
    }

    /// Replaces strict priority ordering of the queue.
    #[must_use]
    pub fn priority_strategy(mut self, strategy: Arc<dyn PriorityStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    /// Validates the configuration and builds the manager.
    ///
    /// # Errors
    /// Returns `BatchError::Config` if the configuration is invalid, or if
    /// `persist_results` is set with neither `results_dir` nor a persister.
    pub fn build(self) -> Result<BatchManager> {
        self.config.validate()?;

        let persist = self.config.persist_results;
        let persister = match (self.persister, persist, &self.config.results_dir) {
            (Some(persister), _, _) => Some(persister),
            (None, true, Some(dir)) => {
                Some(Arc::new(JsonFilePersister::new(dir.clone())) as Arc<dyn ResultPersister>)
            }
            (None, true, None) => return Err(BatchConfigError::MissingResultsDir.into()),
            (None, false, _) => None,
        };

        let config = Arc::new(self.config);
        let scheduler = BatchScheduler::with_policies(
            Arc::clone(&config),
            self.admission.unwrap_or_else(|| Arc::new(ConcurrencyAdmission)),
            self.strategy.unwrap_or_else(|| Arc::new(StrictPriority)),
        );

        Ok(BatchManager {
            inner: Arc::new(ManagerInner {
                processor: BatchProcessor::new(Arc::clone(&config), self.fetcher),
                scheduler,
                batches: RwLock::new(HashMap::new()),
                metrics: MetricsRecorder::new(config.enable_metrics),
                persister,
                wake: Notify::new(),
                run_loop: Mutex::new(None),
                tasks: TaskTracker::new(),
                config,
            }),
        })
    }
}

/// Handle to a batch engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct BatchManager {
    inner: Arc<ManagerInner>,
}

impl BatchManager {
    /// Starts building a manager around `fetcher`.
    pub fn builder(config: BatchConfig, fetcher: Arc<dyn Fetcher>) -> BatchManagerBuilder {
        BatchManagerBuilder {
            config,
            fetcher,
            persister: None,
            admission: None,
            strategy: None,
        }
    }

    /// Builds a manager with default policies.
    ///
    /// # Errors
    /// Returns `BatchError::Config` if the configuration is invalid.
    pub fn new(config: BatchConfig, fetcher: Arc<dyn Fetcher>) -> Result<Self> {
        Self::builder(config, fetcher).build()
    }

    /// The configuration this manager runs with.
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    // ---- submission ----

    /// Submits GET requests for `urls`.
    ///
    /// # Errors
    /// `EmptyBatch` if `urls` is empty; otherwise as [`submit_batch`](Self::submit_batch).
    pub fn submit_urls<I, S>(&self, urls: I, options: BatchOptions) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.submit_batch(BatchRequest::from_urls(urls)?.with_options(options))
    }

    /// Submits pre-built requests.
    ///
    /// # Errors
    /// `EmptyBatch` if `requests` is empty; otherwise as [`submit_batch`](Self::submit_batch).
    pub fn submit_requests(
        &self,
        requests: Vec<FetchRequest>,
        options: BatchOptions,
    ) -> Result<String> {
        self.submit_batch(BatchRequest::new(requests)?.with_options(options))
    }

    /// Validates and enqueues a batch. Returns once it is queued, not once it ran.
    ///
    /// # Errors
    /// Validation errors (`EmptyBatch`, `Validation`, `Duplicate`,
    /// `UnknownDependency`, `DependencyFailed`) or `QueueFull`.
    pub fn submit_batch(&self, request: BatchRequest) -> Result<String> {
        let request = self.inner.track(request)?;
        match self.inner.scheduler.schedule(Arc::clone(&request)) {
            Ok(scheduled) => Ok(self.inner.accepted(&request, scheduled)),
            Err(err) => {
                self.inner.untrack(&request.id);
                Err(err)
            }
        }
    }

    /// Like [`submit_batch`](Self::submit_batch), but waits up to `timeout` for queue room.
    ///
    /// # Errors
    /// As `submit_batch`; `QueueFull` if no room opened up in time.
    pub async fn submit_batch_wait(
        &self,
        request: BatchRequest,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let request = self.inner.track(request)?;
        match self.inner.scheduler.schedule_wait(Arc::clone(&request), timeout).await {
            Ok(scheduled) => Ok(self.inner.accepted(&request, scheduled)),
            Err(err) => {
                self.inner.untrack(&request.id);
                Err(err)
            }
        }
    }

    // ---- queries ----

    /// Current status of a batch.
    pub fn get_batch_status(&self, batch_id: &str) -> Option<BatchStatus> {
        self.inner.batches.read().get(batch_id).map(|tracked| tracked.status)
    }

    /// Latest known result of a batch.
    ///
    /// Outcomes are added as requests finish, so a running batch reports partial
    /// counts. A cancelled batch keeps whatever finished before the cancel.
    pub fn get_batch_result(&self, batch_id: &str) -> Option<BatchResult> {
        self.inner.batches.read().get(batch_id).map(|tracked| {
            let mut result = tracked.result.clone();
            result.status = tracked.status;
            result
        })
    }

    /// Live progress of a batch, when progress tracking is enabled.
    pub fn get_batch_progress(&self, batch_id: &str) -> Option<BatchProgress> {
        self.inner.batches.read().get(batch_id).and_then(|tracked| tracked.progress.clone())
    }

    // ---- control ----

    /// Cancels a pending, running, or paused batch.
    ///
    /// A pending batch never starts. A running batch stops at its next checkpoint.
    /// Returns `false` for unknown or already finished batches.
    pub fn cancel_batch(&self, batch_id: &str) -> bool {
        self.inner.cancel(batch_id)
    }

    /// Pauses a running batch. Returns `false` unless it is `Running`.
    pub fn pause_batch(&self, batch_id: &str) -> bool {
        self.inner.set_paused(batch_id, true)
    }

    /// Resumes a paused batch. Returns `false` unless it is `Paused`.
    pub fn resume_batch(&self, batch_id: &str) -> bool {
        self.inner.set_paused(batch_id, false)
    }

    /// Polls until the batch is terminal or `timeout` elapses.
    ///
    /// Returns whatever status is current at that point, so a timed-out wait may
    /// return `Running`. `None` if the batch is unknown.
    pub async fn wait_for_batch(
        &self,
        batch_id: &str,
        timeout: Option<Duration>,
        poll_interval: Duration,
    ) -> Option<BatchStatus> {
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        loop {
            let status = self.get_batch_status(batch_id)?;
            if status.is_terminal() {
                return Some(status);
            }
            if deadline.is_some_and(|deadline| tokio::time::Instant::now() >= deadline) {
                return Some(status);
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// Submits `urls`, waits for the batch, and returns its result.
    ///
    /// Starts the run loop if it is not running.
    ///
    /// # Errors
    /// Submission errors, as [`submit_urls`](Self::submit_urls).
    pub async fn process_urls_and_wait<I, S>(
        &self,
        urls: I,
        options: BatchOptions,
        timeout: Option<Duration>,
    ) -> Result<BatchResult>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.start();
        let batch_id = self.submit_urls(urls, options)?;
        self.wait_and_collect(&batch_id, timeout).await
    }

    /// Submits `requests`, waits for the batch, and returns its result.
    ///
    /// # Errors
    /// Submission errors, as [`submit_requests`](Self::submit_requests).
    pub async fn process_requests_and_wait(
        &self,
        requests: Vec<FetchRequest>,
        options: BatchOptions,
        timeout: Option<Duration>,
    ) -> Result<BatchResult> {
        self.start();
        let batch_id = self.submit_requests(requests, options)?;
        self.wait_and_collect(&batch_id, timeout).await
    }

    async fn wait_and_collect(
        &self,
        batch_id: &str,
        timeout: Option<Duration>,
    ) -> Result<BatchResult> {
        let poll_interval = self.inner.config.scheduler_poll_interval();
        self.wait_for_batch(batch_id, timeout, poll_interval).await;
        self.get_batch_result(batch_id)
            .ok_or_else(|| BatchError::NotFound(batch_id.to_string()))
    }

    /// Stops tracking a finished batch and returns its final result.
    ///
    /// `None` if the batch is unknown or still being processed. The scheduler
    /// keeps its terminal status, so later batches may still depend on it.
    pub fn remove_batch(&self, batch_id: &str) -> Option<BatchResult> {
        let mut batches = self.inner.batches.write();
        if !batches.get(batch_id)?.settled || !self.inner.is_recorded(batch_id) {
            return None;
        }
        let tracked = batches.remove(batch_id)?;
        drop(batches);

        debug!(batch_id = %batch_id, "Batch removed");
        let mut result = tracked.result;
        result.status = tracked.status;
        Some(result)
    }

    /// Removes every finished batch that completed more than `older_than` ago.
    ///
    /// Returns how many were removed.
    pub fn purge_finished(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };

        let mut batches = self.inner.batches.write();
        let before = batches.len();
        batches.retain(|batch_id, tracked| {
            !(tracked.settled
                && tracked.result.completed_at.is_some_and(|completed| completed <= cutoff)
                && self.inner.is_recorded(batch_id))
        });
        let purged = before - batches.len();
        drop(batches);

        if purged > 0 {
            info!(purged, "Finished batches purged");
        }
        purged
    }

    // ---- reporting ----

    /// Batches that have not reached a terminal state, oldest first.
    pub fn list_active_batches(&self) -> Vec<BatchSummary> {
        let mut active: Vec<BatchSummary> = self
            .inner
            .batches
            .read()
            .values()
            .filter(|tracked| !tracked.status.is_terminal())
            .map(|tracked| BatchSummary {
                id: tracked.request.id.clone(),
                status: tracked.status,
                priority: tracked.request.priority,
                total_requests: tracked.request.requests.len(),
                created_at: tracked.request.created_at,
            })
            .collect();
        active.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        active
    }

    /// Queue, waiting, and running occupancy.
    pub fn get_queue_statistics(&self) -> SchedulerStatistics {
        self.inner.scheduler.statistics()
    }

    /// Snapshot of aggregate metrics.
    pub fn get_processing_metrics(&self) -> BatchMetrics {
        self.inner.metrics.snapshot()
    }

    // ---- lifecycle ----

    /// Spawns the run loop. Returns `false` if it is already running.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) -> bool {
        let mut run_loop = self.inner.run_loop.lock();
        if run_loop.is_some() {
            return false;
        }

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(ManagerInner::run(Arc::clone(&self.inner), shutdown.clone()));
        *run_loop = Some(RunLoop { shutdown, handle });
        info!(
            max_concurrent_batches = self.inner.config.max_concurrent_batches,
            "Batch manager started"
        );
        true
    }

    /// Cancels running batches, stops the run loop, and waits for in-flight
    /// batch tasks and persistence writes. Returns `false` if it was not running.
    pub async fn stop(&self) -> bool {
        let Some(run_loop) = self.inner.run_loop.lock().take() else {
            return false;
        };

        let cancelled = self.inner.cancel_running();
        run_loop.shutdown.cancel();
        if let Err(err) = run_loop.handle.await {
            warn!(error = %err, "Run loop ended abnormally");
        }

        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.tasks.reopen();

        info!(cancelled, "Batch manager stopped");
        true
    }

    /// Returns `true` while the run loop is active.
    pub fn is_running(&self) -> bool {
        self.inner.run_loop.lock().is_some()
    }

    /// Runs `f` with the manager started, stopping it afterwards.
    ///
    /// If the future panics or is dropped early, running batches are cancelled
    /// and the loop is signalled to exit.
    pub async fn scoped<F, Fut, T>(&self, f: F) -> T
    where
        F: FnOnce(Self) -> Fut,
        Fut: Future<Output = T>,
    {
        self.start();
        let mut guard = ShutdownGuard {
            inner: Some(Arc::clone(&self.inner)),
        };
        let output = f(self.clone()).await;
        guard.inner = None;
        self.stop().await;
        output
    }
}

impl fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchManager")
            .field("config", &self.inner.config)
            .field("tracked_batches", &self.inner.batches.try_read().map(|b| b.len()).unwrap_or(0))
            .field("scheduler", &self.inner.scheduler)
            .finish_non_exhaustive()
    }
}

struct ShutdownGuard {
    inner: Option<Arc<ManagerInner>>,
}

impl Drop for ShutdownGuard {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            warn!("Scoped batch manager exited early, shutting down");
            inner.shutdown_now();
        }
    }
}

impl ManagerInner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        debug!("Batch run loop started");
        let poll_interval = self.config.scheduler_poll_interval();

        loop {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                error!(error = %panic_message(panic), "Run loop tick panicked");
            }

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = self.wake.notified() => {}
                () = tokio::time::sleep(poll_interval) => {}
            }
        }

        debug!("Batch run loop stopped");
    }

    /// Starts every batch the scheduler will admit right now.
    fn tick(self: &Arc<Self>) {
        self.scheduler.promote_ready();
        while let Some(batch) = self.scheduler.next_batch() {
            if !self.begin(&batch) {
                self.scheduler.release(&batch.id);
                continue;
            }
            let inner = Arc::clone(self);
            self.tasks.spawn(async move { inner.execute(batch).await });
        }
    }

    /// Validates a submission and starts tracking it.
    fn track(&self, request: BatchRequest) -> Result<Arc<BatchRequest>> {
        if request.requests.is_empty() {
            return Err(BatchError::EmptyBatch);
        }
        if request.max_concurrent == 0 {
            return Err(BatchError::Validation("max_concurrent must be greater than 0".to_string()));
        }
        if request.timeout.is_some_and(|timeout| timeout.is_zero()) {
            return Err(BatchError::Validation("timeout must be greater than 0".to_string()));
        }
        if request.depends_on.iter().any(|dependency| *dependency == request.id) {
            return Err(BatchError::Validation(format!(
                "Batch '{}' cannot depend on itself",
                request.id
            )));
        }

        let mut batches = self.batches.write();
        if batches.contains_key(&request.id) {
            return Err(BatchError::Duplicate(request.id));
        }
        for dependency in &request.depends_on {
            let status = batches
                .get(dependency)
                .map(|tracked| tracked.status)
                .or_else(|| self.scheduler.finished_status(dependency));
            match status {
                None => return Err(BatchError::UnknownDependency(dependency.clone())),
                Some(status @ (BatchStatus::Failed | BatchStatus::Cancelled)) => {
                    return Err(BatchError::DependencyFailed {
                        dependency: dependency.clone(),
                        status,
                    });
                }
                Some(_) => {}
            }
        }

        let request = Arc::new(request);
        let progress = self
            .config
            .enable_progress_tracking
            .then(|| BatchProgress::new(&request.id, request.requests.len()));
        batches.insert(
            request.id.clone(),
            TrackedBatch {
                request: Arc::clone(&request),
                status: BatchStatus::Pending,
                result: BatchResult::new(&request.id, request.requests.len()),
                progress,
                settled: false,
            },
        );
        drop(batches);

        self.metrics.record_submitted();
        Ok(request)
    }

    /// Whether the scheduler holds the terminal status dependents are checked against.
    fn is_recorded(&self, batch_id: &str) -> bool {
        self.scheduler.finished_status(batch_id).is_some()
    }

    fn untrack(&self, batch_id: &str) {
        self.batches.write().remove(batch_id);
        self.metrics.record_withdrawn();
    }

    fn accepted(&self, request: &BatchRequest, scheduled: Scheduled) -> String {
        info!(
            batch_id = %request.id,
            priority = %request.priority,
            requests = request.requests.len(),
            scheduled = ?scheduled,
            "Batch submitted"
        );
        self.wake.notify_one();
        request.id.clone()
    }

    /// Moves a dequeued batch from `Pending` to `Running`.
    fn begin(&self, batch: &BatchRequest) -> bool {
        {
            let mut batches = self.batches.write();
            let Some(tracked) = batches.get_mut(&batch.id) else {
                return false;
            };
            if tracked.status != BatchStatus::Pending {
                debug!(
                    batch_id = %batch.id,
                    status = %tracked.status,
                    "Skipping batch no longer pending"
                );
                return false;
            }
            tracked.status = BatchStatus::Running;
            tracked.result.mark_started();
            if let Some(progress) = tracked.progress.as_mut() {
                progress.start();
            }
            // Registered under the lock so a concurrent cancel always finds the control.
            self.processor.register(&batch.id);
        }

        self.metrics.record_started();
        info!(batch_id = %batch.id, "Batch started");
        true
    }

    async fn execute(self: Arc<Self>, batch: Arc<BatchRequest>) {
        let sink = self.request_sink(&batch);
        let processed = AssertUnwindSafe(self.processor.process_batch(&batch, Some(sink)))
            .catch_unwind()
            .await;

        let result = processed.unwrap_or_else(|panic| {
            let message = panic_message(panic);
            error!(batch_id = %batch.id, error = %message, "Batch processing panicked");
            self.processor.forget(&batch.id);

            let mut result = self.batches.read().get(&batch.id).map_or_else(
                || BatchResult::new(&batch.id, batch.requests.len()),
                |tracked| tracked.result.clone(),
            );
            result.add_error(BatchError::Execution(message).to_string());
            result.finalize(BatchStatus::Failed);
            result
        });

        self.finish(&batch, result);
    }

    /// Per-request sink feeding the tracked result, tracked progress, and the
    /// batch's own progress callback.
    ///
    /// Outcomes arriving after the tracked result was finalized are ignored.
    fn request_sink(self: &Arc<Self>, batch: &Arc<BatchRequest>) -> RequestProgressCallback {
        let manager: Weak<Self> = Arc::downgrade(self);
        let user = batch.progress_callback.clone();
        let batch_id = batch.id.clone();
        let total = batch.requests.len();

        Arc::new(move |outcome: &RequestOutcome, completed: usize, failed: usize| {
            if let Some(manager) = manager.upgrade() {
                let mut batches = manager.batches.write();
                if let Some(tracked) = batches.get_mut(&batch_id)
                    && !tracked.result.is_complete()
                {
                    tracked.result.add_result(outcome.clone());
                    if let Some(progress) = tracked.progress.as_mut() {
                        progress.update(completed, failed, Some(&outcome.url));
                    }
                }
            }
            if let Some(callback) = &user {
                callback(&batch_id, completed, total, Some(&outcome.url));
            }
        })
    }

    /// Records the processor's result and resolves dependents.
    fn finish(&self, batch: &BatchRequest, result: BatchResult) {
        let result = {
            let mut batches = self.batches.write();
            let Some(tracked) = batches.get_mut(&batch.id) else {
                return;
            };
            // A cancel issued while running already finalized the tracked result.
            if !tracked.result.is_complete() {
                tracked.status = result.status;
                tracked.result = result;
            }
            tracked.settled = true;
            tracked.result.clone()
        };

        self.metrics.record_finished(&result, true);
        match result.status {
            BatchStatus::Failed => {
                warn!(batch_id = %batch.id, errors = ?result.errors, "Batch failed");
            }
            status => {
                info!(
                    batch_id = %batch.id,
                    status = %status,
                    successful = result.successful_requests,
                    failed = result.failed_requests,
                    "Batch finished"
                );
            }
        }

        let error = (result.status == BatchStatus::Failed).then(|| {
            let message = result.errors.last().map_or("unknown error", String::as_str);
            BatchError::Execution(message.to_string())
        });
        self.settle(batch, &result, error);
    }

    /// Post-terminal work shared by every path: dependents, persistence, callbacks.
    fn settle(&self, batch: &BatchRequest, result: &BatchResult, error: Option<BatchError>) {
        let resolution = self.scheduler.complete(&batch.id, result.status);
        self.persist(result);
        invoke_callbacks(batch, result, error.as_ref());
        self.fail_dependents(resolution.failed);
        self.wake.notify_one();
    }

    /// Fails every batch stuck behind an unsuccessful dependency, transitively.
    fn fail_dependents(&self, failed: Vec<FailedDependency>) {
        let mut worklist = failed;
        while let Some(FailedDependency { batch, dependency, status }) = worklist.pop() {
            let error = BatchError::DependencyFailed { dependency, status };
            let Some((_, result)) = self.finalize_pending(&batch.id, BatchStatus::Failed, &error)
            else {
                continue;
            };
            warn!(batch_id = %batch.id, error = %error, "Batch failed on dependency");

            let resolution = self.scheduler.complete(&batch.id, BatchStatus::Failed);
            self.persist(&result);
            invoke_callbacks(&batch, &result, Some(&error));
            worklist.extend(resolution.failed);
        }
    }

    /// Finalizes a batch that never started. Returns `None` if it was not pending.
    fn finalize_pending(
        &self,
        batch_id: &str,
        status: BatchStatus,
        error: &BatchError,
    ) -> Option<(Arc<BatchRequest>, BatchResult)> {
        let (request, result) = {
            let mut batches = self.batches.write();
            let tracked = batches.get_mut(batch_id)?;
            if tracked.status != BatchStatus::Pending {
                return None;
            }
            tracked.result.add_error(error.to_string());
            tracked.result.finalize(status);
            tracked.status = status;
            tracked.settled = true;
            (Arc::clone(&tracked.request), tracked.result.clone())
        };
        self.metrics.record_finished(&result, false);
        Some((request, result))
    }

    fn cancel(&self, batch_id: &str) -> bool {
        let status = {
            let mut batches = self.batches.write();
            let Some(tracked) = batches.get_mut(batch_id) else {
                return false;
            };
            match tracked.status {
                BatchStatus::Running | BatchStatus::Paused => {
                    // Requests finished so far stay in the result.
                    tracked.result.add_error(BatchError::Cancelled.to_string());
                    tracked.result.finalize(BatchStatus::Cancelled);
                    tracked.status = BatchStatus::Cancelled;
                    BatchStatus::Running
                }
                status => status,
            }
        };

        match status {
            BatchStatus::Pending => {
                self.scheduler.cancel(batch_id);
                let cancelled =
                    self.finalize_pending(batch_id, BatchStatus::Cancelled, &BatchError::Cancelled);
                let Some((request, result)) = cancelled else {
                    // The run loop started it in the meantime.
                    return self.cancel(batch_id);
                };
                info!(batch_id = %batch_id, "Pending batch cancelled");
                self.settle(&request, &result, None);
                true
            }
            BatchStatus::Running => {
                info!(batch_id = %batch_id, "Cancelling running batch");
                self.processor.cancel_batch(batch_id);
                true
            }
            _ => false,
        }
    }

    fn set_paused(&self, batch_id: &str, paused: bool) -> bool {
        let (from, to) = if paused {
            (BatchStatus::Running, BatchStatus::Paused)
        } else {
            (BatchStatus::Paused, BatchStatus::Running)
        };

        let mut batches = self.batches.write();
        let Some(tracked) = batches.get_mut(batch_id) else {
            return false;
        };
        if tracked.status != from {
            return false;
        }

        let signalled = if paused {
            self.processor.pause_batch(batch_id)
        } else {
            self.processor.resume_batch(batch_id)
        };
        if signalled {
            tracked.status = to;
            info!(batch_id = %batch_id, status = %to, "Batch state changed");
        }
        signalled
    }

    /// Cancels every running or paused batch and returns how many there were.
    fn cancel_running(&self) -> usize {
        let running: Vec<String> = self
            .batches
            .read()
            .values()
            .filter(|tracked| matches!(tracked.status, BatchStatus::Running | BatchStatus::Paused))
            .map(|tracked| tracked.request.id.clone())
            .collect();
        running.iter().filter(|batch_id| self.cancel(batch_id)).count()
    }

    /// Synchronous teardown for drop paths: cancel and signal, without waiting.
    fn shutdown_now(&self) {
        let Some(run_loop) = self.run_loop.lock().take() else {
            return;
        };
        self.cancel_running();
        run_loop.shutdown.cancel();
    }

    /// Hands a terminal result to the persister without waiting for it.
    fn persist(&self, result: &BatchResult) {
        let Some(persister) = self.persister.clone() else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(batch_id = %result.id, "No runtime available, result not persisted");
            return;
        };

        let result = result.clone();
        self.tasks.spawn_on(
            async move {
                match persister.persist_result(&result).await {
                    Ok(()) => debug!(batch_id = %result.id, "Result persisted"),
                    Err(err) => {
                        warn!(batch_id = %result.id, error = %err, "Failed to persist result");
                    }
                }
            },
            &handle,
        );
    }
}

/// Runs completion and error callbacks, isolating panics.
fn invoke_callbacks(batch: &BatchRequest, result: &BatchResult, error: Option<&BatchError>) {
    if let Some(callback) = &batch.completion_callback
        && let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(result)))
    {
        warn!(batch_id = %batch.id, error = %panic_message(panic), "Completion callback panicked");
    }

    if result.status != BatchStatus::Failed {
        return;
    }
    if let (Some(callback), Some(error)) = (&batch.error_callback, error)
        && let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| callback(error)))
    {
        warn!(batch_id = %batch.id, error = %panic_message(panic), "Error callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use volley_abstraction::{FetchResponse, FnFetcher};

    fn manager(config: BatchConfig) -> BatchManager {
        let fetcher: Arc<dyn Fetcher> = Arc::new(FnFetcher::new(|request: FetchRequest| async move {
            Ok(FetchResponse::new(request.url, 200, "ok"))
        }));
        BatchManager::new(config, fetcher).unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let fetcher: Arc<dyn Fetcher> = Arc::new(FnFetcher::new(|request: FetchRequest| async move {
            Ok(FetchResponse::new(request.url, 200, ""))
        }));
        let err = BatchManager::new(
            BatchConfig {
                max_concurrent_batches: 0,
                ..BatchConfig::default()
            },
            Arc::clone(&fetcher),
        )
        .unwrap_err();
        assert!(matches!(err, BatchError::Config(BatchConfigError::InvalidMaxConcurrentBatches)));

        let config = BatchConfig {
            persist_results: true,
            ..BatchConfig::default()
        };
        let err = BatchManager::new(config, fetcher).unwrap_err();
        assert!(matches!(err, BatchError::Config(BatchConfigError::MissingResultsDir)));
    }

    #[test]
    fn test_submit_validation() {
        let manager = manager(BatchConfig::default());

        let err = manager.submit_urls(Vec::<String>::new(), BatchOptions::new()).unwrap_err();
        assert!(err.to_string().contains("empty"));

        let err = manager
            .submit_urls(["https://a"], BatchOptions::new().depends_on("missing"))
            .unwrap_err();
        assert!(matches!(err, BatchError::UnknownDependency(ref id) if id == "missing"));

        let request = BatchRequest::from_urls(["https://a"]).unwrap().with_id("same");
        manager.submit_batch(request.clone()).unwrap();
        assert!(matches!(manager.submit_batch(request).unwrap_err(), BatchError::Duplicate(_)));

        let selfish = BatchRequest::from_urls(["https://a"])
            .unwrap()
            .with_id("me")
            .depends_on("me");
        assert!(matches!(manager.submit_batch(selfish).unwrap_err(), BatchError::Validation(_)));
    }

    #[test]
    fn test_pending_batch_tracking() {
        let manager = manager(BatchConfig::default());
        let id = manager.submit_urls(["https://a", "https://b"], BatchOptions::new()).unwrap();

        assert_eq!(manager.get_batch_status(&id), Some(BatchStatus::Pending));
        assert_eq!(manager.get_batch_result(&id).unwrap().total_requests, 2);
        assert_eq!(manager.get_batch_progress(&id).unwrap().completed_requests, 0);
        assert_eq!(manager.list_active_batches().len(), 1);
        assert_eq!(manager.get_queue_statistics().queue.total, 1);
        assert_eq!(manager.get_processing_metrics().queued_batches, 1);
        assert!(manager.get_batch_status("nope").is_none());
    }

    #[test]
    fn test_cancel_pending_batch() {
        let manager = manager(BatchConfig::default());
        let id = manager.submit_urls(["https://a"], BatchOptions::new()).unwrap();

        assert!(manager.cancel_batch(&id));
        assert_eq!(manager.get_batch_status(&id), Some(BatchStatus::Cancelled));
        assert!(!manager.cancel_batch(&id));
        assert!(!manager.cancel_batch("unknown"));
        assert_eq!(manager.get_queue_statistics().queue.total, 0);
        assert_eq!(manager.get_processing_metrics().cancelled_batches, 1);
    }

    #[test]
    fn test_remove_only_settled_batches() {
        let manager = manager(BatchConfig::default());
        let kept = manager.submit_urls(["https://a"], BatchOptions::new()).unwrap();
        let gone = manager.submit_urls(["https://b"], BatchOptions::new()).unwrap();

        assert!(manager.remove_batch(&kept).is_none(), "pending batches stay tracked");
        assert!(manager.remove_batch("unknown").is_none());

        assert!(manager.cancel_batch(&gone));
        let removed = manager.remove_batch(&gone).unwrap();
        assert_eq!(removed.status, BatchStatus::Cancelled);
        assert!(removed.completed_at.is_some());
        assert!(manager.get_batch_status(&gone).is_none());
        assert!(manager.remove_batch(&gone).is_none());

        // The terminal status outlives the tracked entry for dependency checks.
        let err = manager
            .submit_urls(["https://c"], BatchOptions::new().depends_on(gone.as_str()))
            .unwrap_err();
        assert!(matches!(
            err,
            BatchError::DependencyFailed {
                status: BatchStatus::Cancelled,
                ..
            }
        ));
    }

    #[test]
    fn test_purge_finished() {
        let manager = manager(BatchConfig::default());
        let pending = manager.submit_urls(["https://a"], BatchOptions::new()).unwrap();
        let cancelled = manager.submit_urls(["https://b"], BatchOptions::new()).unwrap();
        manager.cancel_batch(&cancelled);

        assert_eq!(manager.purge_finished(Duration::from_secs(3600)), 0);
        assert_eq!(manager.purge_finished(Duration::ZERO), 1);
        assert!(manager.get_batch_status(&cancelled).is_none());
        assert_eq!(manager.get_batch_status(&pending), Some(BatchStatus::Pending));
    }

    #[test]
    fn test_pause_requires_running() {
        let manager = manager(BatchConfig::default());
        let id = manager.submit_urls(["https://a"], BatchOptions::new()).unwrap();
        assert!(!manager.pause_batch(&id));
        assert!(!manager.resume_batch(&id));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let manager = manager(BatchConfig::default());
        assert!(manager.start());
        assert!(!manager.start());
        assert!(manager.is_running());
        assert!(manager.stop().await);
        assert!(!manager.stop().await);
        assert!(!manager.is_running());
    }
}
