// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Request signals evaluated alongside token validation: timing, Origin
//! and honeypot.
//!
//! Soft signals accumulate into [`SoftReasons`], an ordered set whose
//! iteration order is fixed by the declaration order of [`SoftReason`].

use crate::config::{OriginMode, SecurityConfig};
use serde::{Serialize, Serializer};
use std::collections::BTreeSet;

/// Name of the honeypot form field.
pub const HONEYPOT_FIELD: &str = "eforms_hp";
/// Field set by the client script once JavaScript has run.
pub const JS_OK_FIELD: &str = "js_ok";
/// Field set when a form is re-rendered after a failed email send.
pub const EMAIL_RETRY_FIELD: &str = "eforms_email_retry";

/// Non-fatal suspicion signal. Variant order is the canonical output order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SoftReason {
    MinFillTime,
    AgeAdvisory,
    JsMissing,
    OriginSoft,
}

impl SoftReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MinFillTime => "min_fill_time",
            Self::AgeAdvisory => "age_advisory",
            Self::JsMissing => "js_missing",
            Self::OriginSoft => "origin_soft",
        }
    }
}

impl std::fmt::Display for SoftReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SoftReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Deduplicated soft reasons in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct SoftReasons(BTreeSet<SoftReason>);

impl SoftReasons {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, reason: SoftReason) {
        self.0.insert(reason);
    }

    pub fn extend(&mut self, other: &SoftReasons) {
        self.0.extend(other.0.iter().copied());
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, reason: SoftReason) -> bool {
        self.0.contains(&reason)
    }

    pub fn iter(&self) -> impl Iterator<Item = SoftReason> + '_ {
        self.0.iter().copied()
    }

    pub fn as_strs(&self) -> Vec<&'static str> {
        self.iter().map(|r| r.as_str()).collect()
    }
}

impl FromIterator<SoftReason> for SoftReasons {
    fn from_iter<I: IntoIterator<Item = SoftReason>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Result of a signal evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SignalOutcome {
    pub hard_fail: bool,
    pub soft_reasons: SoftReasons,
}

/// Inputs for the timing check.
#[derive(Debug, Clone, Copy)]
pub struct TimingInput<'a> {
    /// Token issue time; `None` when no token record was available
    pub issued_at: Option<i64>,
    pub now: i64,
    pub js_ok: Option<&'a str>,
    pub email_retry: bool,
}

/// Fill-time, form-age and JavaScript marker checks.
pub fn evaluate_timing(config: &SecurityConfig, input: TimingInput<'_>) -> SignalOutcome {
    let mut outcome = SignalOutcome::default();

    if let Some(issued_at) = input.issued_at {
        let elapsed = input.now.saturating_sub(issued_at);
        let min_fill = config.min_fill_seconds as i64;
        if min_fill > 0 && !input.email_retry && elapsed < min_fill {
            outcome.soft_reasons.insert(SoftReason::MinFillTime);
        }
        let max_age = config.max_form_age() as i64;
        if max_age > 0 && elapsed > max_age {
            outcome.soft_reasons.insert(SoftReason::AgeAdvisory);
        }
    }

    if input.js_ok.map(str::trim) != Some("1") {
        if config.js_hard_mode {
            outcome.hard_fail = true;
        } else {
            outcome.soft_reasons.insert(SoftReason::JsMissing);
        }
    }

    outcome
}

/// How the request's Origin header relates to the site's origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginState {
    Same,
    Cross,
    Unknown,
    Missing,
}

/// Normalized `(scheme, host, port)` triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    scheme: String,
    host: String,
    port: u16,
}

impl Origin {
    /// Parse an `http`/`https` origin. Default ports are filled in.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case("null") {
            return None;
        }
        let url = url::Url::parse(raw).ok()?;
        let scheme = url.scheme().to_ascii_lowercase();
        if scheme != "http" && scheme != "https" {
            return None;
        }
        let host = url.host_str()?.to_ascii_lowercase();
        if host.is_empty() {
            return None;
        }
        let port = url.port_or_known_default()?;
        Some(Self { scheme, host, port })
    }

    /// Origin from a Host header value and a scheme.
    pub fn from_host(host: &str, scheme: &str) -> Option<Self> {
        let host: String = host.chars().filter(|c| !c.is_whitespace()).collect();
        if host.is_empty() {
            return None;
        }
        Self::parse(&format!("{scheme}://{host}"))
    }
}

/// The site's own origin: the configured public origin, else the request's
/// Host header over `http`.
pub fn server_origin(public_origin: Option<&str>, host: Option<&str>) -> Option<Origin> {
    match public_origin {
        Some(origin) => Origin::parse(origin),
        None => host.and_then(|h| Origin::from_host(h, "http")),
    }
}

/// Classify the Origin header against the server origin.
pub fn origin_state(origin_header: Option<&str>, server: Option<&Origin>) -> OriginState {
    let header = match origin_header.map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => h,
        None => return OriginState::Missing,
    };
    match (Origin::parse(header), server) {
        (Some(origin), Some(server)) if &origin == server => OriginState::Same,
        (Some(_), Some(_)) => OriginState::Cross,
        _ => OriginState::Unknown,
    }
}

/// Apply the configured origin mode to an origin state.
pub fn evaluate_origin(config: &SecurityConfig, state: OriginState) -> SignalOutcome {
    let mut outcome = SignalOutcome::default();
    match config.origin_mode {
        OriginMode::Off => {}
        OriginMode::Soft => {
            if state != OriginState::Same {
                outcome.soft_reasons.insert(SoftReason::OriginSoft);
            }
        }
        OriginMode::Hard => match state {
            OriginState::Same => {}
            OriginState::Cross | OriginState::Unknown => outcome.hard_fail = true,
            OriginState::Missing if config.origin_missing_hard => outcome.hard_fail = true,
            OriginState::Missing => outcome.soft_reasons.insert(SoftReason::OriginSoft),
        },
    }
    outcome
}

/// True when the honeypot field carries any non-whitespace value.
pub fn honeypot_triggered(value: Option<&str>) -> bool {
    value.map(|v| !v.trim().is_empty()).unwrap_or(false)
}
