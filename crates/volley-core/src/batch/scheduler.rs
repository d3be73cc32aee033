//! Decides which pending batch runs next.
//!
//! Batches with unresolved dependencies wait outside the priority queue and are
//! promoted when [`BatchScheduler::complete`] reports the last dependency done.
//! Admission onto a running slot is capped globally and can additionally be
//! gated by an [`AdmissionPolicy`].

use crate::batch::config::BatchConfig;
use crate::batch::error::{BatchError, Result};
use crate::batch::queue::{PriorityQueue, PriorityStrategy, QueueStatistics, StrictPriority};
use crate::batch::types::{BatchRequest, BatchStatus};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::iter::Sum;
use std::ops::Add;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Estimated cost of running a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ResourceEstimate {
    /// Memory held while the batch runs, in KB.
    pub memory_kb: u64,
    /// Concurrent request slots the batch occupies.
    pub cpu_units: usize,
}

impl Add for ResourceEstimate {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            memory_kb: self.memory_kb + rhs.memory_kb,
            cpu_units: self.cpu_units + rhs.cpu_units,
        }
    }
}

impl Sum for ResourceEstimate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Gate applied to the queue head before it takes a running slot.
///
/// The global `max_concurrent_batches` cap is enforced by the scheduler itself;
/// a policy can only be stricter.
pub trait AdmissionPolicy: Send + Sync + fmt::Debug {
    /// Estimates what `batch` will consume while running.
    fn estimate(&self, batch: &BatchRequest) -> ResourceEstimate;

    /// Decides whether a batch costing `candidate` may start while `running`
    /// batches already hold `in_use`.
    fn admits(
        &self,
        candidate: &ResourceEstimate,
        in_use: &ResourceEstimate,
        running: usize,
    ) -> bool;
}

/// Admits everything the global cap allows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConcurrencyAdmission;

impl AdmissionPolicy for ConcurrencyAdmission {
    fn estimate(&self, _batch: &BatchRequest) -> ResourceEstimate {
        ResourceEstimate::default()
    }

    fn admits(
        &self,
        _candidate: &ResourceEstimate,
        _in_use: &ResourceEstimate,
        _running: usize,
    ) -> bool {
        true
    }
}

/// Defers batches whose estimated memory or CPU would exceed the configured ceilings.
#[derive(Debug, Clone, Copy)]
pub struct ResourceAwareAdmission {
    memory_limit_kb: u64,
    max_cpu_units: usize,
    request_memory_kb: u64,
    per_batch_concurrency: usize,
}

impl ResourceAwareAdmission {
    /// Builds the policy from the memory and CPU settings of `config`.
    pub fn from_config(config: &BatchConfig) -> Self {
        Self {
            memory_limit_kb: config.memory_limit_mb.saturating_mul(1024),
            max_cpu_units: config.max_cpu_units,
            request_memory_kb: config.estimated_request_memory_kb,
            per_batch_concurrency: config.max_concurrent_requests_per_batch,
        }
    }
}

impl AdmissionPolicy for ResourceAwareAdmission {
    fn estimate(&self, batch: &BatchRequest) -> ResourceEstimate {
        ResourceEstimate {
            memory_kb: (batch.requests.len() as u64).saturating_mul(self.request_memory_kb),
            cpu_units: batch.max_concurrent.min(self.per_batch_concurrency).max(1),
        }
    }

    fn admits(
        &self,
        candidate: &ResourceEstimate,
        in_use: &ResourceEstimate,
        running: usize,
    ) -> bool {
        // An idle engine always takes the head, so an oversized batch cannot starve.
        if running == 0 {
            return true;
        }
        let total = *in_use + *candidate;
        total.memory_kb <= self.memory_limit_kb && total.cpu_units <= self.max_cpu_units
    }
}

/// Where a newly scheduled batch landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// In the priority queue, eligible to run.
    Queued,
    /// Held until its dependencies complete.
    Waiting,
}

/// A waiting batch whose dependency ended unsuccessfully.
#[derive(Debug, Clone)]
pub struct FailedDependency {
    /// The dependent batch, removed from the waiting set.
    pub batch: Arc<BatchRequest>,
    /// ID of the dependency that failed.
    pub dependency: String,
    /// Terminal status of that dependency.
    pub status: BatchStatus,
}

/// Effect of a batch finishing on the waiting set.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolution {
    /// IDs moved from waiting to the queue.
    pub promoted: Vec<String>,
    /// Batches that can never run because a dependency failed.
    pub failed: Vec<FailedDependency>,
}

/// Snapshot of scheduler occupancy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStatistics {
    /// Priority queue contents.
    pub queue: QueueStatistics,
    /// Batches held on dependencies.
    pub waiting: usize,
    /// Batches holding a running slot.
    pub running: usize,
}

enum DependencyState {
    Ready,
    Pending,
    Failed(String, BatchStatus),
}

fn dependency_state(
    batch: &BatchRequest,
    finished: &HashMap<String, BatchStatus>,
) -> DependencyState {
    let mut pending = false;
    for dependency in &batch.depends_on {
        match finished.get(dependency) {
            Some(BatchStatus::Completed) => {}
            Some(&status) => return DependencyState::Failed(dependency.clone(), status),
            None => pending = true,
        }
    }
    if pending { DependencyState::Pending } else { DependencyState::Ready }
}

/// Priority-ordered, dependency-aware admission of batches onto running slots.
pub struct BatchScheduler {
    config: Arc<BatchConfig>,
    queue: PriorityQueue<Arc<BatchRequest>>,
    // Lock order: waiting, then finished.
    waiting: Mutex<Vec<Arc<BatchRequest>>>,
    finished: RwLock<HashMap<String, BatchStatus>>,
    running: Mutex<HashMap<String, ResourceEstimate>>,
    admission: Arc<dyn AdmissionPolicy>,
}

impl BatchScheduler {
    /// Creates a scheduler with strict priority ordering and concurrency-only admission.
    pub fn new(config: Arc<BatchConfig>) -> Self {
        Self::with_policies(config, Arc::new(ConcurrencyAdmission), Arc::new(StrictPriority))
    }

    /// Creates a scheduler with explicit admission and queue ordering policies.
    pub fn with_policies(
        config: Arc<BatchConfig>,
        admission: Arc<dyn AdmissionPolicy>,
        strategy: Arc<dyn PriorityStrategy>,
    ) -> Self {
        let queue = PriorityQueue::with_strategy(Some(config.max_queue_size), strategy);
        Self {
            config,
            queue,
            waiting: Mutex::new(Vec::new()),
            finished: RwLock::new(HashMap::new()),
            running: Mutex::new(HashMap::new()),
            admission,
        }
    }

    /// Queues a batch, or parks it until its dependencies complete.
    ///
    /// # Errors
    /// `DependencyFailed` if a dependency already ended unsuccessfully,
    /// `QueueFull` if the queue has no room.
    pub fn schedule(&self, batch: Arc<BatchRequest>) -> Result<Scheduled> {
        if !self.park_or_ready(&batch)? {
            return Ok(Scheduled::Waiting);
        }
        if self.queue.enqueue(Arc::clone(&batch), batch.priority) {
            debug!(batch_id = %batch.id, priority = %batch.priority, "Batch queued");
            Ok(Scheduled::Queued)
        } else {
            Err(BatchError::QueueFull {
                capacity: self.config.max_queue_size,
            })
        }
    }

    /// Like [`schedule`](Self::schedule), but waits up to `timeout` for queue room.
    ///
    /// # Errors
    /// Same as `schedule`; `QueueFull` once the timeout elapses.
    pub async fn schedule_wait(
        &self,
        batch: Arc<BatchRequest>,
        timeout: Option<Duration>,
    ) -> Result<Scheduled> {
        if !self.park_or_ready(&batch)? {
            return Ok(Scheduled::Waiting);
        }
        let priority = batch.priority;
        self.queue.enqueue_wait(batch, priority, timeout).await?;
        Ok(Scheduled::Queued)
    }

    /// Returns `Ok(true)` if the batch may be queued now; parks it otherwise.
    fn park_or_ready(&self, batch: &Arc<BatchRequest>) -> Result<bool> {
        let mut waiting = self.waiting.lock();
        let finished = self.finished.read();
        match dependency_state(batch, &finished) {
            DependencyState::Ready => Ok(true),
            DependencyState::Pending => {
                debug!(
                    batch_id = %batch.id,
                    depends_on = ?batch.depends_on,
                    "Batch waiting on dependencies"
                );
                waiting.push(Arc::clone(batch));
                Ok(false)
            }
            DependencyState::Failed(dependency, status) => {
                Err(BatchError::DependencyFailed { dependency, status })
            }
        }
    }

    /// Takes the next eligible batch and reserves a running slot for it.
    ///
    /// Returns `None` when the global cap is reached, the queue is empty, or the
    /// admission policy defers the head.
    pub fn next_batch(&self) -> Option<Arc<BatchRequest>> {
        let mut running = self.running.lock();
        if running.len() >= self.config.max_concurrent_batches {
            return None;
        }

        let in_use: ResourceEstimate = running.values().copied().sum();
        let active = running.len();
        let mut admitted = None;
        let batch = self.queue.dequeue_if(|batch| {
            let estimate = self.admission.estimate(batch);
            if self.admission.admits(&estimate, &in_use, active) {
                admitted = Some(estimate);
                true
            } else {
                debug!(batch_id = %batch.id, ?estimate, ?in_use, "Admission deferred");
                false
            }
        })?;

        running.insert(batch.id.clone(), admitted.unwrap_or_default());
        Some(batch)
    }

    /// Frees a running slot without recording an outcome.
    pub fn release(&self, batch_id: &str) -> bool {
        self.running.lock().remove(batch_id).is_some()
    }

    /// Records a terminal status and re-evaluates waiting batches.
    pub fn complete(&self, batch_id: &str, status: BatchStatus) -> DependencyResolution {
        self.running.lock().remove(batch_id);

        let mut resolution = DependencyResolution::default();
        let mut ready = Vec::new();
        {
            let mut waiting = self.waiting.lock();
            let mut finished = self.finished.write();
            finished.insert(batch_id.to_string(), status);

            let mut still_waiting = Vec::with_capacity(waiting.len());
            for batch in waiting.drain(..) {
                match dependency_state(&batch, &finished) {
                    DependencyState::Ready => ready.push(batch),
                    DependencyState::Pending => still_waiting.push(batch),
                    DependencyState::Failed(dependency, status) => {
                        resolution.failed.push(FailedDependency {
                            batch,
                            dependency,
                            status,
                        });
                    }
                }
            }
            *waiting = still_waiting;
        }

        resolution.promoted = self.enqueue_ready(ready);
        if !resolution.promoted.is_empty() || !resolution.failed.is_empty() {
            info!(
                batch_id = %batch_id,
                status = %status,
                promoted = resolution.promoted.len(),
                failed_dependents = resolution.failed.len(),
                "Dependencies resolved"
            );
        }
        resolution
    }

    /// Re-checks the waiting set and queues whatever became ready.
    ///
    /// Picks up batches whose promotion was blocked by a full queue.
    pub fn promote_ready(&self) -> Vec<String> {
        let ready: Vec<_> = {
            let mut waiting = self.waiting.lock();
            let finished = self.finished.read();
            let (ready, still_waiting): (Vec<_>, Vec<_>) = waiting.drain(..).partition(|batch| {
                matches!(dependency_state(batch, &finished), DependencyState::Ready)
            });
            *waiting = still_waiting;
            ready
        };
        self.enqueue_ready(ready)
    }

    fn enqueue_ready(&self, ready: Vec<Arc<BatchRequest>>) -> Vec<String> {
        let mut promoted = Vec::with_capacity(ready.len());
        for batch in ready {
            if self.queue.enqueue(Arc::clone(&batch), batch.priority) {
                promoted.push(batch.id.clone());
            } else {
                debug!(batch_id = %batch.id, "Queue full, batch stays waiting");
                self.waiting.lock().push(batch);
            }
        }
        promoted
    }

    /// Removes a pending batch from the queue or the waiting set.
    pub fn cancel(&self, batch_id: &str) -> Option<Arc<BatchRequest>> {
        if let Some(batch) = self.queue.remove_where(|batch| batch.id == batch_id) {
            return Some(batch);
        }
        let mut waiting = self.waiting.lock();
        let index = waiting.iter().position(|batch| batch.id == batch_id)?;
        Some(waiting.remove(index))
    }

    /// Terminal status recorded for a batch, if any.
    pub fn finished_status(&self, batch_id: &str) -> Option<BatchStatus> {
        self.finished.read().get(batch_id).copied()
    }

    /// Batches in the priority queue.
    pub fn queued_count(&self) -> usize {
        self.queue.size()
    }

    /// Batches held on dependencies.
    pub fn waiting_count(&self) -> usize {
        self.waiting.lock().len()
    }

    /// Batches holding a running slot.
    pub fn running_count(&self) -> usize {
        self.running.lock().len()
    }

    /// Returns `true` if a running slot is free.
    pub fn has_capacity(&self) -> bool {
        self.running_count() < self.config.max_concurrent_batches
    }

    /// Occupancy snapshot.
    pub fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            queue: self.queue.statistics(),
            waiting: self.waiting_count(),
            running: self.running_count(),
        }
    }
}

impl fmt::Debug for BatchScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchScheduler")
            .field("queue", &self.queue)
            .field("admission", &self.admission)
            .field("max_concurrent_batches", &self.config.max_concurrent_batches)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::types::BatchPriority;

    fn batch(id: &str) -> Arc<BatchRequest> {
        Arc::new(
            BatchRequest::from_urls(["https://example.com"])
                .unwrap()
                .with_id(id),
        )
    }

    fn scheduler(max_concurrent_batches: usize) -> BatchScheduler {
        BatchScheduler::new(Arc::new(BatchConfig {
            max_concurrent_batches,
            ..BatchConfig::default()
        }))
    }

    #[test]
    fn test_next_batch_respects_priority() {
        let scheduler = scheduler(5);
        let low = BatchRequest::from_urls(["https://a"])
            .unwrap()
            .with_id("low")
            .with_priority(BatchPriority::Low);
        let urgent = BatchRequest::from_urls(["https://b"])
            .unwrap()
            .with_id("urgent")
            .with_priority(BatchPriority::Urgent);
        scheduler.schedule(Arc::new(low)).unwrap();
        scheduler.schedule(Arc::new(urgent)).unwrap();

        assert_eq!(scheduler.next_batch().unwrap().id, "urgent");
        assert_eq!(scheduler.next_batch().unwrap().id, "low");
        assert_eq!(scheduler.running_count(), 2);
    }

    #[test]
    fn test_global_concurrency_cap() {
        let scheduler = scheduler(1);
        scheduler.schedule(batch("a")).unwrap();
        scheduler.schedule(batch("b")).unwrap();

        assert_eq!(scheduler.next_batch().unwrap().id, "a");
        assert!(scheduler.next_batch().is_none());
        assert!(!scheduler.has_capacity());

        scheduler.complete("a", BatchStatus::Completed);
        assert_eq!(scheduler.next_batch().unwrap().id, "b");
    }

    #[test]
    fn test_dependency_waits_then_promotes() {
        let scheduler = scheduler(5);
        scheduler.schedule(batch("parent")).unwrap();
        let child = Arc::new(
            BatchRequest::from_urls(["https://c"])
                .unwrap()
                .with_id("child")
                .depends_on("parent"),
        );
        assert_eq!(scheduler.schedule(child).unwrap(), Scheduled::Waiting);
        assert_eq!(scheduler.waiting_count(), 1);

        assert_eq!(scheduler.next_batch().unwrap().id, "parent");
        assert!(scheduler.next_batch().is_none());

        let resolution = scheduler.complete("parent", BatchStatus::Completed);
        assert_eq!(resolution.promoted, vec!["child".to_string()]);
        assert!(resolution.failed.is_empty());
        assert_eq!(scheduler.next_batch().unwrap().id, "child");
    }

    #[test]
    fn test_failed_dependency_reported() {
        let scheduler = scheduler(5);
        let child = Arc::new(
            BatchRequest::from_urls(["https://c"])
                .unwrap()
                .with_id("child")
                .depends_on("parent"),
        );
        scheduler.schedule(child).unwrap();

        let resolution = scheduler.complete("parent", BatchStatus::Cancelled);
        assert!(resolution.promoted.is_empty());
        assert_eq!(resolution.failed.len(), 1);
        assert_eq!(resolution.failed[0].batch.id, "child");
        assert_eq!(resolution.failed[0].status, BatchStatus::Cancelled);
        assert_eq!(scheduler.waiting_count(), 0);
        assert_eq!(scheduler.finished_status("parent"), Some(BatchStatus::Cancelled));
        assert!(scheduler.finished_status("child").is_none());

        let late = Arc::new(BatchRequest::from_urls(["https://d"]).unwrap().depends_on("parent"));
        let err = scheduler.schedule(late).unwrap_err();
        assert!(matches!(err, BatchError::DependencyFailed { status: BatchStatus::Cancelled, .. }));
    }

    #[test]
    fn test_queue_full() {
        let config = BatchConfig {
            max_queue_size: 1,
            ..BatchConfig::default()
        };
        let scheduler = BatchScheduler::new(Arc::new(config));
        scheduler.schedule(batch("a")).unwrap();
        let err = scheduler.schedule(batch("b")).unwrap_err();
        assert!(matches!(err, BatchError::QueueFull { capacity: 1 }));
    }

    #[test]
    fn test_cancel_pending() {
        let scheduler = scheduler(5);
        scheduler.schedule(batch("queued")).unwrap();
        let waiting = Arc::new(
            BatchRequest::from_urls(["https://w"])
                .unwrap()
                .with_id("waiting")
                .depends_on("queued"),
        );
        scheduler.schedule(waiting).unwrap();

        assert_eq!(scheduler.cancel("waiting").unwrap().id, "waiting");
        assert_eq!(scheduler.cancel("queued").unwrap().id, "queued");
        assert!(scheduler.cancel("queued").is_none());
        assert!(scheduler.next_batch().is_none());
    }

    #[test]
    fn test_resource_aware_defers_large_batches() {
        let config = BatchConfig {
            memory_limit_mb: 1,
            estimated_request_memory_kb: 512,
            ..BatchConfig::default()
        };
        let admission = Arc::new(ResourceAwareAdmission::from_config(&config));
        let scheduler =
            BatchScheduler::with_policies(Arc::new(config), admission, Arc::new(StrictPriority));

        let big = BatchRequest::from_urls(["https://1", "https://2"]).unwrap().with_id("big");
        let small = BatchRequest::from_urls(["https://3"]).unwrap().with_id("small");
        scheduler.schedule(Arc::new(big)).unwrap();
        scheduler.schedule(Arc::new(small)).unwrap();

        // 1024 KB budget: the 2-request batch fills it, so the next one waits
        assert_eq!(scheduler.next_batch().unwrap().id, "big");
        assert!(scheduler.next_batch().is_none());
        assert_eq!(scheduler.queued_count(), 1);

        scheduler.complete("big", BatchStatus::Completed);
        assert_eq!(scheduler.next_batch().unwrap().id, "small");
    }

    #[test]
    fn test_resource_aware_admits_oversized_when_idle() {
        let config = BatchConfig {
            memory_limit_mb: 1,
            estimated_request_memory_kb: 4096,
            ..BatchConfig::default()
        };
        let policy = ResourceAwareAdmission::from_config(&config);
        let huge = BatchRequest::from_urls(["https://1", "https://2"]).unwrap();
        let estimate = policy.estimate(&huge);

        assert_eq!(estimate.memory_kb, 8192);
        let busy = ResourceEstimate {
            memory_kb: 1,
            cpu_units: 1,
        };
        assert!(policy.admits(&estimate, &ResourceEstimate::default(), 0));
        assert!(!policy.admits(&estimate, &busy, 1));
    }

    #[test]
    fn test_statistics() {
        let scheduler = scheduler(5);
        scheduler.schedule(batch("a")).unwrap();
        scheduler.schedule(batch("b")).unwrap();
        scheduler.next_batch();

        let stats = scheduler.statistics();
        assert_eq!(stats.queue.total, 1);
        assert_eq!(stats.running, 1);
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn test_schedule_wait_times_out_when_full() {
        let config = BatchConfig {
            max_queue_size: 1,
            ..BatchConfig::default()
        };
        let scheduler = BatchScheduler::new(Arc::new(config));
        scheduler.schedule(batch("a")).unwrap();

        let err = scheduler
            .schedule_wait(batch("b"), Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, BatchError::QueueFull { .. }));

        scheduler.next_batch();
        let scheduled = scheduler
            .schedule_wait(batch("c"), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert_eq!(scheduled, Scheduled::Queued);
    }
}
