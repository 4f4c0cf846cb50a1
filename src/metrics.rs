// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Prometheus counters for the submission pipeline.
//!
//! | Metric | Labels |
//! |--------|--------|
//! | `eforms_tokens_minted_total` | `mode` |
//! | `eforms_submissions_total` | `outcome` |
//! | `eforms_throttle_rejections_total` | `state` |
//! | `eforms_ledger_reservations_total` | `result` |
//! | `eforms_gc_deleted_total` | `type` |

use crate::gc::{GcKind, GcSummary};
use prometheus::{Encoder, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    Registration(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    Encoding(String),
}

/// Counters registered in a per-app registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    tokens_minted: IntCounterVec,
    submissions: IntCounterVec,
    throttle_rejections: IntCounterVec,
    ledger_reservations: IntCounterVec,
    gc_deleted: IntCounterVec,
}

fn counter(
    registry: &Registry,
    name: &str,
    help: &str,
    label: &str,
) -> Result<IntCounterVec, MetricsError> {
    let vec = IntCounterVec::new(Opts::new(name, help), &[label])?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();
        Ok(Self {
            tokens_minted: counter(
                &registry,
                "eforms_tokens_minted_total",
                "Submission tokens minted",
                "mode",
            )?,
            submissions: counter(
                &registry,
                "eforms_submissions_total",
                "Submissions by pipeline outcome",
                "outcome",
            )?,
            throttle_rejections: counter(
                &registry,
                "eforms_throttle_rejections_total",
                "Requests rejected by the throttle",
                "state",
            )?,
            ledger_reservations: counter(
                &registry,
                "eforms_ledger_reservations_total",
                "Replay ledger reservation results",
                "result",
            )?,
            gc_deleted: counter(
                &registry,
                "eforms_gc_deleted_total",
                "Files deleted by garbage collection",
                "type",
            )?,
            registry,
        })
    }

    pub fn token_minted(&self, mode: &str) {
        self.tokens_minted.with_label_values(&[mode]).inc();
    }

    pub fn submission(&self, outcome: &str) {
        self.submissions.with_label_values(&[outcome]).inc();
    }

    pub fn throttle_rejected(&self, state: &str) {
        self.throttle_rejections.with_label_values(&[state]).inc();
    }

    pub fn ledger_reservation(&self, result: &str) {
        self.ledger_reservations.with_label_values(&[result]).inc();
    }

    pub fn gc_pass(&self, summary: &GcSummary) {
        for kind in [GcKind::Tokens, GcKind::Ledger, GcKind::Uploads, GcKind::Throttle] {
            let deleted = summary.by_type.get(kind).deleted as u64;
            if deleted > 0 {
                self.gc_deleted
                    .with_label_values(&[kind.as_str()])
                    .inc_by(deleted);
            }
        }
    }

    /// Prometheus text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::Encoding(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::Encoding(e.to_string()))
    }
}
