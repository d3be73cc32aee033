//! Pure helpers over a finished [`BatchResult`].

use crate::batch::types::{BatchResult, RequestOutcome};
use serde::Serialize;
use std::collections::BTreeMap;

/// Summary statistics of one batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatistics {
    /// Recorded outcomes.
    pub total: usize,
    /// Successful outcomes.
    pub successful: usize,
    /// Failed outcomes.
    pub failed: usize,
    /// `successful / total`, or 0.0 for an empty result.
    pub success_rate: f64,
    /// Count of outcomes per status code. Requests with no response are omitted.
    pub status_codes: BTreeMap<u16, usize>,
    /// Mean response time of successful requests, in seconds.
    pub average_response_time: f64,
    /// Bytes downloaded.
    pub total_bytes_downloaded: u64,
}

/// Outcomes that produced a 2xx/3xx response.
pub fn filter_successful_results(result: &BatchResult) -> Vec<&RequestOutcome> {
    result.results.iter().filter(|outcome| outcome.is_success()).collect()
}

/// Outcomes that failed, by error or by status code.
pub fn filter_failed_results(result: &BatchResult) -> Vec<&RequestOutcome> {
    result.results.iter().filter(|outcome| !outcome.is_success()).collect()
}

/// Totals, success rate, and status-code distribution of `result`.
pub fn calculate_batch_statistics(result: &BatchResult) -> BatchStatistics {
    let total = result.results.len();
    let successful = result.results.iter().filter(|outcome| outcome.is_success()).count();

    let mut status_codes = BTreeMap::new();
    for code in result.results.iter().filter_map(|outcome| outcome.status_code) {
        *status_codes.entry(code).or_insert(0) += 1;
    }

    BatchStatistics {
        total,
        successful,
        failed: total - successful,
        success_rate: if total == 0 { 0.0 } else { successful as f64 / total as f64 },
        status_codes,
        average_response_time: result.average_response_time,
        total_bytes_downloaded: result.total_bytes_downloaded,
    }
}
