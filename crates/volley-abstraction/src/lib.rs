//! Fetch abstraction layer for Volley.
//!
//! This module defines the request/response types and the `Fetcher` trait the
//! batch engine drives. The engine never assumes anything about the transport
//! behind a `Fetcher`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Represents an error that can occur while fetching a single request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchError {
    /// The request could not be completed (e.g., connection refused, DNS failure).
    #[error("Request Error: {0}")]
    Request(String),

    /// The request did not complete within its time budget.
    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    /// The request descriptor was rejected before it was sent.
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    /// Other unexpected errors.
    #[error("Other Fetch Error: {0}")]
    Other(String),
}

/// A single fetch request descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    /// The target URL.
    pub url: String,
    /// HTTP-style method name (e.g., "GET", "POST").
    #[serde(default = "default_method")]
    pub method: String,
    /// Request headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional request body.
    #[serde(default)]
    pub body: Option<String>,
    /// Optional per-request timeout, overriding the engine default.
    #[serde(default)]
    pub timeout: Option<Duration>,
    /// Arbitrary caller metadata, carried through untouched.
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl FetchRequest {
    /// Creates a GET request for the given URL.
    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: default_method(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
            metadata: HashMap::new(),
        }
    }

    /// Sets the request method.
    #[must_use]
    pub fn with_method(mut self, method: impl Into<String>) -> Self {
        self.method = method.into();
        self
    }

    /// Adds a single header.
    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    /// Merges a set of headers, keeping headers already present on the request.
    #[must_use]
    pub fn with_headers(mut self, headers: &HashMap<String, String>) -> Self {
        for (name, value) in headers {
            self.headers.entry(name.clone()).or_insert_with(|| value.clone());
        }
        self
    }

    /// Sets the request body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }

    /// Sets the per-request timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// The response to a single fetch request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchResponse {
    /// The URL that produced this response (after any redirects).
    pub url: String,
    /// Status code reported by the transport.
    pub status_code: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Optional response body.
    #[serde(default)]
    pub body: Option<String>,
    /// Number of bytes downloaded for this response.
    pub bytes_downloaded: u64,
}

impl FetchResponse {
    /// Creates a response with the given status and body.
    #[must_use]
    pub fn new(url: impl Into<String>, status_code: u16, body: impl Into<String>) -> Self {
        let body = body.into();
        Self {
            url: url.into(),
            status_code,
            headers: HashMap::new(),
            bytes_downloaded: body.len() as u64,
            body: Some(body),
        }
    }

    /// Returns `true` for 2xx and 3xx status codes.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status_code)
    }
}

/// A capability that executes one fetch request.
///
/// All fetchers must be `Send + Sync`: the batch engine calls them from many
/// tasks at once.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Executes a single request.
    ///
    /// # Errors
    /// Returns a `FetchError` if the request could not be completed. A response
    /// with a non-success status code is not an error at this layer.
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError>;
}

/// Adapts an async closure into a [`Fetcher`].
pub struct FnFetcher<F> {
    f: F,
}

impl<F> FnFetcher<F> {
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> std::fmt::Debug for FnFetcher<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FnFetcher").finish_non_exhaustive()
    }
}

#[async_trait]
impl<F, Fut> Fetcher for FnFetcher<F>
where
    F: Fn(FetchRequest) -> Fut + Send + Sync,
    Fut: Future<Output = Result<FetchResponse, FetchError>> + Send + 'static,
{
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        (self.f)(request.clone()).await
    }
}
