// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! eforms-guard
//!
//! Anti-abuse core for public form submissions. State lives on the local
//! filesystem and is coordinated through exclusive creates and `flock`, so
//! several server processes can share one storage root:
//!
//! - Token store: single-use tokens in hidden, cookie and JS modes
//! - Replay ledger: at-most-once reservation per `(form_id, token)`
//! - Throttle: per-client 60 second windows with cooldown and hard blocks
//! - Challenge verifier: Turnstile, hCaptcha and reCAPTCHA siteverify
//! - Submission pipeline: fixed stage ordering around the ledger commit point
//! - Garbage collector: dry-run/apply sweeps under a global lock

pub mod challenge;
pub mod client_ip;
pub mod clock;
pub mod config;
pub mod error;
pub mod gc;
pub mod handlers;
pub mod ledger;
pub mod lock;
pub mod metrics;
pub mod pipeline;
pub mod signals;
pub mod storage;
pub mod throttle;
pub mod token;

pub use config::Config;
pub use error::{ErrorCode, StorageError};
pub use gc::{GcOptions, GcRunner, GcSummary};
pub use ledger::{Ledger, Reservation};
pub use pipeline::{SubmissionStages, SubmitPipeline};
pub use throttle::{Throttle, ThrottleDecision, ThrottleState};
pub use token::{TokenMode, TokenStore};
