//! Shared test utilities for Volley Core integration tests.
//!
//! The fetcher here never touches the network. Its behaviour is chosen by URL:
//! - a URL containing `/fail` returns a transport error
//! - a URL containing `/status/<code>` returns that status code
//! - a URL registered with [`MockFetcher::flaky`] fails the given number of times first
//! - anything else returns 200 after the configured delay

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use volley_core::{BatchConfig, BatchManager, FetchError, FetchRequest, FetchResponse, Fetcher};

/// Scriptable fetcher that records what it was asked to do.
#[derive(Debug, Default)]
pub struct MockFetcher {
    delay: Duration,
    calls: Mutex<Vec<String>>,
    flaky: Mutex<HashMap<String, u32>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockFetcher {
    /// A fetcher that answers immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A fetcher that sleeps `delay` before every answer.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Self::default()
        })
    }

    /// Makes `url` fail `failures` times before it succeeds.
    pub fn flaky(&self, url: &str, failures: u32) {
        self.flaky.lock().insert(url.to_string(), failures);
    }

    /// URLs in the order their first attempt started.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    /// Number of fetch attempts so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Highest number of simultaneous fetches observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Fetcher for MockFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        self.calls.lock().push(request.url.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        {
            let mut flaky = self.flaky.lock();
            if let Some(remaining) = flaky.get_mut(&request.url)
                && *remaining > 0
            {
                *remaining -= 1;
                return Err(FetchError::Request(format!("flaky failure for {}", request.url)));
            }
        }

        if request.url.contains("/fail") {
            return Err(FetchError::Request("connection refused".to_string()));
        }
        if let Some((_, code)) = request.url.split_once("/status/") {
            let code = code.parse().unwrap_or(500);
            return Ok(FetchResponse::new(&request.url, code, ""));
        }
        Ok(FetchResponse::new(&request.url, 200, format!("body of {}", request.url)))
    }
}

/// Configuration with short timings suitable for tests.
pub fn fast_config() -> BatchConfig {
    BatchConfig {
        max_batch_retries: 2,
        retry_delay_ms: 10,
        max_retry_delay_ms: 50,
        request_timeout_ms: 2_000,
        batch_timeout_ms: 10_000,
        scheduler_poll_interval_ms: 10,
        ..BatchConfig::default()
    }
}

/// A manager around `fetcher` built from `config`.
pub fn manager(config: BatchConfig, fetcher: Arc<MockFetcher>) -> BatchManager {
    BatchManager::new(config, fetcher).expect("valid test configuration")
}

/// `count` distinct URLs under `prefix`.
pub fn urls(prefix: &str, count: usize) -> Vec<String> {
    (0..count).map(|i| format!("https://{prefix}.test/{i}")).collect()
}

/// Generous bound for waits in tests.
pub const WAIT: Option<Duration> = Some(Duration::from_secs(10));

/// Poll interval for `wait_for_batch` in tests.
pub const POLL: Duration = Duration::from_millis(5);
