//! Batch scheduling and execution.

pub mod config;
pub mod error;
pub mod manager;
pub mod metrics;
pub mod persistence;
pub mod processor;
pub mod progress;
pub mod queue;
pub mod scheduler;
pub mod stats;
pub mod types;

pub use config::{BatchConfig, BatchConfigError, RetryPolicy};
pub use error::{BatchError, Result};
pub use manager::{BatchManager, BatchManagerBuilder, BatchSummary};
pub use metrics::BatchMetrics;
pub use persistence::{InMemoryPersister, JsonFilePersister, PersistenceError, ResultPersister};
pub use processor::{BatchProcessor, RequestProgressCallback};
pub use progress::BatchProgress;
pub use queue::{
    AgingPriority, PriorityQueue, PriorityStrategy, QueueItem, QueueStatistics, StrictPriority,
};
pub use scheduler::{
    AdmissionPolicy, BatchScheduler, ConcurrencyAdmission, DependencyResolution, FailedDependency,
    ResourceAwareAdmission, ResourceEstimate, Scheduled, SchedulerStatistics,
};
pub use stats::{
    BatchStatistics, calculate_batch_statistics, filter_failed_results, filter_successful_results,
};
pub use types::{
    BatchOptions, BatchPriority, BatchRequest, BatchResult, BatchStatus, CompletionCallback,
    DEFAULT_MAX_CONCURRENT, ErrorCallback, ProgressCallback, RequestOutcome,
};
