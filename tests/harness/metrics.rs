// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Metrics collection for attack simulation results.

use axum::http::StatusCode;
use eforms_guard::{
    error::ErrorCode,
    pipeline::{SubmitResult, GLOBAL_ERROR_KEY},
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const ALREADY_SUBMITTED: &str = "This form was already submitted.";

/// Collects metrics during attack simulation.
#[derive(Debug, Default)]
pub struct AttackMetrics {
    /// Start time of the attack
    start_time: Option<Instant>,
    /// End time of the attack
    end_time: Option<Instant>,
    /// Count of requests by outcome
    outcomes: HashMap<Outcome, usize>,
    /// Count of requests by client
    requests_per_ip: HashMap<String, usize>,
    /// Latency samples (microseconds)
    latencies: Vec<u64>,
}

/// Possible outcomes for a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Accepted,
    Throttled,
    Duplicate,
    TokenRejected,
    Honeypot,
    OriginForbidden,
    TypeRejected,
    InvalidFormId,
    Failed,
}

impl Outcome {
    /// Classify a pipeline result.
    pub fn from_result(result: &SubmitResult) -> Self {
        if result.ok {
            // Stealth honeypot success carries no submission id
            return if result.submission_id.is_some() {
                Outcome::Accepted
            } else {
                Outcome::Honeypot
            };
        }
        match result.error {
            Some(ErrorCode::Token) => {
                let duplicate = result
                    .errors
                    .get(GLOBAL_ERROR_KEY)
                    .is_some_and(|messages| messages.iter().any(|m| m == ALREADY_SUBMITTED));
                if duplicate {
                    Outcome::Duplicate
                } else {
                    Outcome::TokenRejected
                }
            }
            Some(code) => Self::from_code(code),
            None => Outcome::Failed,
        }
    }

    /// Classify an HTTP response by status and `error` body field.
    pub fn from_http(status: StatusCode, error: Option<&str>) -> Self {
        if status == StatusCode::OK && error.is_none() {
            return Outcome::Accepted;
        }
        match error {
            Some("EFORMS_ERR_THROTTLED") => Outcome::Throttled,
            Some("EFORMS_ERR_TOKEN") => Outcome::TokenRejected,
            Some("EFORMS_ERR_HONEYPOT") => Outcome::Honeypot,
            Some("EFORMS_ERR_ORIGIN_FORBIDDEN") => Outcome::OriginForbidden,
            Some("EFORMS_ERR_TYPE") => Outcome::TypeRejected,
            Some("EFORMS_ERR_INVALID_FORM_ID") => Outcome::InvalidFormId,
            _ => Outcome::Failed,
        }
    }

    fn from_code(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Throttled => Outcome::Throttled,
            ErrorCode::Token => Outcome::TokenRejected,
            ErrorCode::Honeypot => Outcome::Honeypot,
            ErrorCode::OriginForbidden => Outcome::OriginForbidden,
            ErrorCode::Type => Outcome::TypeRejected,
            ErrorCode::InvalidFormId => Outcome::InvalidFormId,
            _ => Outcome::Failed,
        }
    }
}

impl AttackMetrics {
    /// Create a new metrics collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the start of an attack.
    pub fn start(&mut self) {
        self.start_time = Some(Instant::now());
    }

    /// Mark the end of an attack.
    pub fn finish(&mut self) {
        self.end_time = Some(Instant::now());
    }

    /// Record a request outcome.
    pub fn record(&mut self, outcome: Outcome, ip: &str, latency: Duration) {
        *self.outcomes.entry(outcome).or_insert(0) += 1;
        *self.requests_per_ip.entry(ip.to_string()).or_insert(0) += 1;
        self.latencies.push(latency.as_micros() as u64);
    }

    /// Get total request count.
    pub fn total_requests(&self) -> usize {
        self.outcomes.values().sum()
    }

    /// Get count for a specific outcome.
    pub fn count(&self, outcome: Outcome) -> usize {
        self.outcomes.get(&outcome).copied().unwrap_or(0)
    }

    /// Get duration of the attack.
    pub fn duration(&self) -> Duration {
        match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Get block rate (ratio of non-accepted to total).
    pub fn block_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        let accepted = self.count(Outcome::Accepted);
        (total - accepted) as f64 / total as f64
    }

    fn sorted_latencies(&self) -> Vec<u64> {
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        sorted
    }

    /// Get median latency in microseconds.
    pub fn median_latency_us(&self) -> u64 {
        let sorted = self.sorted_latencies();
        sorted.get(sorted.len() / 2).copied().unwrap_or(0)
    }

    /// Get p99 latency in microseconds.
    pub fn p99_latency_us(&self) -> u64 {
        let sorted = self.sorted_latencies();
        if sorted.is_empty() {
            return 0;
        }
        let idx = (sorted.len() as f64 * 0.99) as usize;
        sorted[idx.min(sorted.len() - 1)]
    }

    /// Get number of unique clients that made requests.
    pub fn unique_ips(&self) -> usize {
        self.requests_per_ip.len()
    }

    /// Generate a summary report.
    pub fn report(&self) -> MetricsReport {
        MetricsReport {
            total_requests: self.total_requests(),
            accepted: self.count(Outcome::Accepted),
            throttled: self.count(Outcome::Throttled),
            duplicate: self.count(Outcome::Duplicate),
            token_rejected: self.count(Outcome::TokenRejected),
            honeypot: self.count(Outcome::Honeypot),
            request_rejected: self.count(Outcome::OriginForbidden)
                + self.count(Outcome::TypeRejected)
                + self.count(Outcome::InvalidFormId),
            failed: self.count(Outcome::Failed),
            duration_ms: self.duration().as_millis() as u64,
            block_rate: self.block_rate(),
            median_latency_us: self.median_latency_us(),
            p99_latency_us: self.p99_latency_us(),
            unique_ips: self.unique_ips(),
        }
    }
}

/// Summary report of attack metrics.
#[derive(Debug, Clone)]
pub struct MetricsReport {
    pub total_requests: usize,
    pub accepted: usize,
    pub throttled: usize,
    pub duplicate: usize,
    pub token_rejected: usize,
    pub honeypot: usize,
    pub request_rejected: usize,
    pub failed: usize,
    pub duration_ms: u64,
    pub block_rate: f64,
    pub median_latency_us: u64,
    pub p99_latency_us: u64,
    pub unique_ips: usize,
}

impl std::fmt::Display for MetricsReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Attack Metrics Report ===")?;
        writeln!(f, "Duration:          {} ms", self.duration_ms)?;
        writeln!(f, "Total Requests:    {}", self.total_requests)?;
        writeln!(f)?;
        writeln!(f, "--- Outcomes ---")?;
        writeln!(f, "Accepted:          {}", self.accepted)?;
        writeln!(f, "Throttled:         {}", self.throttled)?;
        writeln!(f, "Duplicate:         {}", self.duplicate)?;
        writeln!(f, "Token Rejected:    {}", self.token_rejected)?;
        writeln!(f, "Honeypot:          {}", self.honeypot)?;
        writeln!(f, "Request Rejected:  {}", self.request_rejected)?;
        writeln!(f, "Failed:            {}", self.failed)?;
        writeln!(f, "Block Rate:        {:.1}%", self.block_rate * 100.0)?;
        writeln!(f)?;
        writeln!(f, "--- Latency ---")?;
        writeln!(f, "Median:            {} us", self.median_latency_us)?;
        writeln!(f, "P99:               {} us", self.p99_latency_us)?;
        writeln!(f)?;
        writeln!(f, "Unique IPs:        {}", self.unique_ips)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_collection() {
        let mut metrics = AttackMetrics::new();
        metrics.start();

        metrics.record(Outcome::Accepted, "10.0.0.1", Duration::from_micros(100));
        metrics.record(Outcome::Duplicate, "10.0.0.2", Duration::from_micros(150));
        metrics.record(Outcome::Throttled, "10.0.0.1", Duration::from_micros(50));

        metrics.finish();

        assert_eq!(metrics.total_requests(), 3);
        assert_eq!(metrics.count(Outcome::Accepted), 1);
        assert_eq!(metrics.count(Outcome::Throttled), 1);
        assert_eq!(metrics.unique_ips(), 2);
        assert_eq!(metrics.median_latency_us(), 100);
    }

    #[test]
    fn test_block_rate() {
        let mut metrics = AttackMetrics::new();
        for _ in 0..3 {
            metrics.record(Outcome::Accepted, "10.0.0.1", Duration::ZERO);
        }
        for _ in 0..7 {
            metrics.record(Outcome::Throttled, "10.0.0.1", Duration::ZERO);
        }

        assert!((metrics.block_rate() - 0.7).abs() < 0.01);
    }

    #[test]
    fn test_http_classification() {
        assert_eq!(Outcome::from_http(StatusCode::OK, None), Outcome::Accepted);
        assert_eq!(
            Outcome::from_http(StatusCode::TOO_MANY_REQUESTS, Some("EFORMS_ERR_THROTTLED")),
            Outcome::Throttled
        );
        assert_eq!(
            Outcome::from_http(StatusCode::OK, Some("EFORMS_ERR_HONEYPOT")),
            Outcome::Honeypot
        );
    }
}
