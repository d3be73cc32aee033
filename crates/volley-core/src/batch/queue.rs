//! Priority queue for pending batches.
//!
//! Items are served by priority first, then in enqueue order. Each priority level
//! is its own FIFO deque, so removal never leaves tombstones behind and selection
//! only compares the four level heads.

use crate::batch::error::BatchError;
use crate::batch::types::BatchPriority;
use parking_lot::Mutex;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::debug;

/// Decides the effective priority of a queued item at dequeue time.
pub trait PriorityStrategy: Send + Sync + fmt::Debug {
    /// Effective priority of an item that has waited `waited` (higher = served first).
    fn effective_priority(&self, priority: BatchPriority, waited: Duration) -> f64;
}

/// Serves strictly by priority level.
#[derive(Debug, Clone, Copy, Default)]
pub struct StrictPriority;

impl PriorityStrategy for StrictPriority {
    fn effective_priority(&self, priority: BatchPriority, _waited: Duration) -> f64 {
        f64::from(priority.value())
    }
}

/// Raises effective priority with waiting time so low levels cannot starve.
#[derive(Debug, Clone, Copy)]
pub struct AgingPriority {
    /// Priority gained per second of waiting.
    pub aging_factor: f64,
}

impl AgingPriority {
    /// Creates an aging strategy.
    #[must_use]
    pub fn new(aging_factor: f64) -> Self {
        Self { aging_factor }
    }
}

impl PriorityStrategy for AgingPriority {
    fn effective_priority(&self, priority: BatchPriority, waited: Duration) -> f64 {
        waited.as_secs_f64().mul_add(self.aging_factor, f64::from(priority.value()))
    }
}

/// An item held by the queue, with its ordering key.
#[derive(Debug, Clone)]
pub struct QueueItem<T> {
    /// The queued value.
    pub item: T,
    /// Priority it was enqueued with.
    pub priority: BatchPriority,
    /// Enqueue time.
    pub enqueued_at: Instant,
    /// Monotonic enqueue counter; breaks ties between equal timestamps.
    pub sequence: u64,
}

impl<T> PartialEq for QueueItem<T> {
    fn eq(&self, other: &Self) -> bool {
        self.sequence == other.sequence
    }
}

impl<T> Eq for QueueItem<T> {}

impl<T> PartialOrd for QueueItem<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for QueueItem<T> {
    /// "Greater" means served first: higher priority, then older, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.enqueued_at.cmp(&self.enqueued_at))
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

/// Snapshot of queue contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStatistics {
    /// Items currently queued.
    pub total: usize,
    /// Configured capacity, if bounded.
    pub max_size: Option<usize>,
    /// Item count per priority level.
    pub by_priority: BTreeMap<BatchPriority, usize>,
}

struct QueueInner<T> {
    /// One FIFO per priority level, indexed by `priority.value() - 1`.
    levels: [VecDeque<QueueItem<T>>; 4],
    len: usize,
    next_sequence: u64,
}

impl<T> QueueInner<T> {
    fn level_index(priority: BatchPriority) -> usize {
        usize::from(priority.value()) - 1
    }
}

/// Concurrency-safe priority queue with FIFO ordering inside a level.
pub struct PriorityQueue<T> {
    inner: Mutex<QueueInner<T>>,
    max_size: Option<usize>,
    strategy: Arc<dyn PriorityStrategy>,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> PriorityQueue<T> {
    /// Creates an unbounded queue with strict priority ordering.
    #[must_use]
    pub fn new() -> Self {
        Self::with_strategy(None, Arc::new(StrictPriority))
    }

    /// Creates a queue holding at most `max_size` items.
    #[must_use]
    pub fn bounded(max_size: usize) -> Self {
        Self::with_strategy(Some(max_size), Arc::new(StrictPriority))
    }

    /// Creates a queue with an explicit capacity and priority strategy.
    #[must_use]
    pub fn with_strategy(max_size: Option<usize>, strategy: Arc<dyn PriorityStrategy>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                levels: std::array::from_fn(|_| VecDeque::new()),
                len: 0,
                next_sequence: 0,
            }),
            max_size,
            strategy,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Configured capacity, if bounded.
    pub fn capacity(&self) -> Option<usize> {
        self.max_size
    }

    /// Inserts an item; returns `false` without inserting when the queue is full.
    pub fn enqueue(&self, item: T, priority: BatchPriority) -> bool {
        let mut inner = self.inner.lock();
        if self.max_size.is_some_and(|max| inner.len >= max) {
            debug!(priority = %priority, size = inner.len, "Queue full, rejecting item");
            return false;
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;
        inner.levels[QueueInner::<T>::level_index(priority)].push_back(QueueItem {
            item,
            priority,
            enqueued_at: Instant::now(),
            sequence,
        });
        inner.len += 1;
        drop(inner);

        self.not_empty.notify_one();
        true
    }

    /// Inserts an item, waiting for room until `timeout` elapses.
    ///
    /// # Errors
    /// Returns `BatchError::QueueFull` if no room opened up in time.
    pub async fn enqueue_wait(
        &self,
        item: T,
        priority: BatchPriority,
        timeout: Option<Duration>,
    ) -> Result<(), BatchError> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut item = Some(item);
        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if self.max_size.is_none_or(|max| inner.len < max) {
                    let sequence = inner.next_sequence;
                    inner.next_sequence += 1;
                    if let Some(item) = item.take() {
                        inner.levels[QueueInner::<T>::level_index(priority)].push_back(QueueItem {
                            item,
                            priority,
                            enqueued_at: Instant::now(),
                            sequence,
                        });
                        inner.len += 1;
                    }
                    drop(inner);
                    self.not_empty.notify_one();
                    return Ok(());
                }
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(BatchError::QueueFull {
                            capacity: self.max_size.unwrap_or(0),
                        });
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Removes and returns the next item, or `None` when empty.
    pub fn dequeue(&self) -> Option<T> {
        self.dequeue_if(|_| true)
    }

    /// Removes the next item only if `accept` approves it.
    ///
    /// Selection and removal happen under one lock, so the item inspected is the
    /// item removed.
    pub fn dequeue_if<F>(&self, accept: F) -> Option<T>
    where
        F: FnOnce(&T) -> bool,
    {
        let mut inner = self.inner.lock();
        let level = self.select_level(&inner)?;
        let head = inner.levels[level].front()?;
        if !accept(&head.item) {
            return None;
        }

        let entry = inner.levels[level].pop_front()?;
        inner.len -= 1;
        drop(inner);

        self.not_full.notify_one();
        Some(entry.item)
    }

    /// Removes and returns the next item, waiting until one arrives or `timeout` elapses.
    pub async fn dequeue_wait(&self, timeout: Option<Duration>) -> Option<T> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.dequeue() {
                return Some(item);
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Removes the first queued item matching `predicate`, wherever it sits.
    pub fn remove_where<F>(&self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let mut inner = self.inner.lock();
        let (level, index) = inner.levels.iter().enumerate().find_map(|(level, items)| {
            items.iter().position(|entry| predicate(&entry.item)).map(|index| (level, index))
        })?;

        let entry = inner.levels[level].remove(index)?;
        inner.len -= 1;
        drop(inner);

        self.not_full.notify_one();
        Some(entry.item)
    }

    /// Number of queued items.
    pub fn size(&self) -> usize {
        self.inner.lock().len
    }

    /// Returns `true` when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns `true` when a bounded queue is at capacity.
    pub fn is_full(&self) -> bool {
        self.max_size.is_some_and(|max| self.size() >= max)
    }

    /// Drops every queued item and returns how many were removed.
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let removed = inner.len;
        for level in &mut inner.levels {
            level.clear();
        }
        inner.len = 0;
        drop(inner);

        self.not_full.notify_waiters();
        removed
    }

    /// Item count, capacity, and a per-priority breakdown.
    pub fn statistics(&self) -> QueueStatistics {
        let inner = self.inner.lock();
        let by_priority = BatchPriority::ALL
            .iter()
            .map(|&priority| (priority, inner.levels[QueueInner::<T>::level_index(priority)].len()))
            .collect();
        QueueStatistics {
            total: inner.len,
            max_size: self.max_size,
            by_priority,
        }
    }

    /// Picks the level whose head should be served next.
    fn select_level(&self, inner: &QueueInner<T>) -> Option<usize> {
        let now = Instant::now();
        let mut best: Option<(usize, f64, &QueueItem<T>)> = None;

        for (level, items) in inner.levels.iter().enumerate() {
            let Some(head) = items.front() else {
                continue;
            };
            let waited = now.saturating_duration_since(head.enqueued_at);
            let score = self.strategy.effective_priority(head.priority, waited);

            let better = match best {
                None => true,
                Some((_, best_score, best_head)) => match score.total_cmp(&best_score) {
                    Ordering::Greater => true,
                    Ordering::Equal => head > best_head,
                    Ordering::Less => false,
                },
            };
            if better {
                best = Some((level, score, head));
            }
        }

        best.map(|(level, _, _)| level)
    }
}

impl<T: Clone> PriorityQueue<T> {
    /// Returns a copy of the next item without removing it.
    pub fn peek(&self) -> Option<T> {
        let inner = self.inner.lock();
        let level = self.select_level(&inner)?;
        inner.levels[level].front().map(|entry| entry.item.clone())
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for PriorityQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("size", &self.inner.try_lock().map(|q| q.len).unwrap_or(0))
            .field("max_size", &self.max_size)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}
