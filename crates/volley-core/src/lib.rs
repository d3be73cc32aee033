//! Volley Core - batch request scheduling and execution.
//!
//! This crate provides:
//! - A priority queue with pluggable priority strategies
//! - A dependency-aware scheduler with admission control
//! - A processor that runs one batch with bounded concurrency, retries, and timeouts
//! - A manager that ties them together behind a single handle
//! - Configuration loading and logging setup
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use volley_core::{
//!     BatchConfig, BatchManager, BatchOptions, FetchRequest, FetchResponse, FnFetcher,
//! };
//!
//! #[tokio::main]
//! async fn main() -> volley_core::Result<()> {
//!     let fetcher = Arc::new(FnFetcher::new(|request: FetchRequest| async move {
//!         Ok(FetchResponse::new(request.url, 200, "ok"))
//!     }));
//!     let manager = BatchManager::new(BatchConfig::default(), fetcher)?;
//!
//!     let urls = ["https://example.com/a", "https://example.com/b"];
//!     let result = manager
//!         .process_urls_and_wait(urls, BatchOptions::new(), Some(Duration::from_secs(30)))
//!         .await?;
//!     println!("{} of {} succeeded", result.successful_requests, result.total_requests);
//!
//!     manager.stop().await;
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
#[cfg(feature = "http")]
pub mod http;
pub mod logging;

pub use batch::{
    AdmissionPolicy, AgingPriority, BatchConfig, BatchConfigError, BatchError, BatchManager,
    BatchManagerBuilder, BatchMetrics, BatchOptions, BatchPriority, BatchProcessor, BatchProgress,
    BatchRequest, BatchResult, BatchScheduler, BatchStatistics, BatchStatus, BatchSummary,
    CompletionCallback, ConcurrencyAdmission, ErrorCallback, InMemoryPersister, JsonFilePersister,
    PersistenceError, PriorityQueue, PriorityStrategy, ProgressCallback, RequestOutcome,
    ResourceAwareAdmission, Result, ResultPersister, RetryPolicy, SchedulerStatistics,
    StrictPriority, calculate_batch_statistics, filter_failed_results, filter_successful_results,
};
pub use config::{ConfigError, VolleyConfig, default_config_path, load_config};
#[cfg(feature = "http")]
pub use http::HttpFetcher;
pub use logging::{LogFormat, LoggingConfig, init_logging};
pub use volley_abstraction::{FetchError, FetchRequest, FetchResponse, Fetcher, FnFetcher};
