//! `reqwest`-backed [`Fetcher`].

use async_trait::async_trait;
use reqwest::Method;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;
use volley_abstraction::{FetchError, FetchRequest, FetchResponse, Fetcher};

/// Fetcher that issues real HTTP requests through a shared `reqwest::Client`.
#[derive(Debug, Clone, Default)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher with a default client.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing client, e.g. one with a proxy or custom TLS setup.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchResponse, FetchError> {
        let method = Method::from_bytes(request.method.to_uppercase().as_bytes()).map_err(|e| {
            FetchError::InvalidRequest(format!("method '{}': {}", request.method, e))
        })?;

        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        if let Some(timeout) = request.timeout {
            builder = builder.timeout(timeout);
        }

        let response = builder.send().await.map_err(|e| map_error(&e, request.timeout))?;
        let status_code = response.status().as_u16();
        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value.to_str().ok().map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(|e| map_error(&e, request.timeout))?;

        debug!(
            url = %request.url,
            status = status_code,
            bytes = body.len(),
            "HTTP request finished"
        );

        Ok(FetchResponse {
            url: request.url.clone(),
            status_code,
            headers,
            bytes_downloaded: body.len() as u64,
            body: Some(body),
        })
    }
}

fn map_error(err: &reqwest::Error, timeout: Option<Duration>) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout(timeout.unwrap_or_default())
    } else if err.is_builder() {
        FetchError::InvalidRequest(err.to_string())
    } else {
        FetchError::Request(err.to_string())
    }
}
