// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Submission pipeline.
//!
//! Stages run in a fixed order and every rejection short-circuits the rest:
//!
//! 1. request shape (body size, form id)
//! 2. storage health
//! 3. security: throttle, then token validation with origin and timing signals
//! 4. honeypot (burns the ledger entry when the token was valid)
//! 5. [`SubmissionStages::prepare`]: normalize, validate, coerce
//! 6. challenge, when required or when the client sent a widget response
//! 7. ledger reservation, the at-most-once commit point
//! 8. [`SubmissionStages::commit`]: side effects such as sending email
//!
//! Nothing with an external consequence happens before step 7 succeeds.

use crate::challenge::{ChallengeVerdict, ChallengeVerifier};
use crate::client_ip;
use crate::clock::Clock;
use crate::config::{Config, HoneypotResponse, IpMode};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::ledger::{Ledger, Reservation};
use crate::metrics::Metrics;
use crate::signals::{honeypot_triggered, SoftReasons, EMAIL_RETRY_FIELD, HONEYPOT_FIELD, JS_OK_FIELD};
use crate::storage::{self, HealthReport, StorageHealth};
use crate::throttle::Throttle;
use crate::token::{
    is_valid_form_id, MintedToken, SecurityInput, TokenMode, TokenStore, INSTANCE_FIELD, MODE_FIELD,
    TOKEN_FIELD,
};
use axum::http::StatusCode;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Key for messages that belong to the form rather than a field.
pub const GLOBAL_ERROR_KEY: &str = "_global";

/// Field-keyed error messages.
pub type FieldErrors = BTreeMap<String, Vec<String>>;

/// What downstream stages see of a submission that passed security.
#[derive(Debug, Clone)]
pub struct SubmissionContext {
    pub form_id: String,
    /// Ledger identity; a fresh id when no token was presented
    pub submission_id: String,
    pub mode: TokenMode,
    pub token_ok: bool,
    pub soft_reasons: SoftReasons,
    pub require_challenge: bool,
    /// Soft reasons reached the spam threshold
    pub suspect: bool,
    /// Submitted fields, minus the pipeline's own control fields
    pub fields: HashMap<String, String>,
}

/// Result shape returned by downstream stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageOutcome {
    pub ok: bool,
    pub status: StatusCode,
    pub error_code: Option<ErrorCode>,
    pub errors: FieldErrors,
}

impl StageOutcome {
    pub fn ok() -> Self {
        Self {
            ok: true,
            status: StatusCode::OK,
            error_code: None,
            errors: FieldErrors::new(),
        }
    }

    pub fn fail(code: ErrorCode) -> Self {
        Self {
            ok: false,
            status: code.status(),
            error_code: Some(code),
            errors: FieldErrors::new(),
        }
    }

    /// Field validation failure; re-rendered with a `200`.
    pub fn invalid(errors: FieldErrors) -> Self {
        Self {
            ok: false,
            status: StatusCode::OK,
            error_code: None,
            errors,
        }
    }
}

/// Downstream collaborators: field handling before the commit point and
/// side effects after it.
#[axum::async_trait]
pub trait SubmissionStages: Send + Sync {
    /// Normalize, validate and coerce fields. Runs before the challenge.
    async fn prepare(&self, ctx: &mut SubmissionContext) -> StageOutcome;

    /// Perform side effects. Runs only after a successful reservation.
    async fn commit(&self, ctx: &SubmissionContext) -> StageOutcome;
}

/// Accepts every submission and only logs the commit.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughStages;

#[axum::async_trait]
impl SubmissionStages for PassthroughStages {
    async fn prepare(&self, _ctx: &mut SubmissionContext) -> StageOutcome {
        StageOutcome::ok()
    }

    async fn commit(&self, ctx: &SubmissionContext) -> StageOutcome {
        info!(
            form_id = %ctx.form_id,
            submission_id = %ctx.submission_id,
            suspect = ctx.suspect,
            fields = ctx.fields.len(),
            "Submission committed"
        );
        StageOutcome::ok()
    }
}

/// A parsed submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub form_id: String,
    pub fields: HashMap<String, String>,
    pub cookie_token: Option<String>,
    pub origin: Option<String>,
    pub host: Option<String>,
    pub client_ip: IpAddr,
    pub body_len: usize,
}

impl SubmitRequest {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Response body for a submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub ok: bool,
    #[serde(skip)]
    pub status: StatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: FieldErrors,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submission_id: Option<String>,
    #[serde(skip_serializing_if = "SoftReasons::is_empty")]
    pub soft_reasons: SoftReasons,
    #[serde(skip)]
    pub retry_after: Option<u64>,
    /// Fresh hidden-mode token for re-rendering after an email failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<MintedToken>,
    /// The client must fetch a new token before resubmitting
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub remint_required: bool,
}

impl SubmitResult {
    fn accepted(submission_id: Option<String>) -> Self {
        Self {
            ok: true,
            status: StatusCode::OK,
            error: None,
            errors: FieldErrors::new(),
            submission_id,
            soft_reasons: SoftReasons::new(),
            retry_after: None,
            token: None,
            remint_required: false,
        }
    }

    fn error(code: ErrorCode) -> Self {
        Self {
            ok: false,
            status: code.status(),
            error: Some(code),
            ..Self::accepted(None)
        }
    }

    fn from_outcome(outcome: StageOutcome) -> Self {
        Self {
            ok: outcome.ok,
            status: outcome.status,
            error: outcome.error_code,
            errors: outcome.errors,
            ..Self::accepted(None)
        }
    }

    fn with_global_error(mut self, message: &str) -> Self {
        self.errors
            .entry(GLOBAL_ERROR_KEY.to_string())
            .or_default()
            .push(message.to_string());
        self
    }
}

/// Per-request memo of the storage probe plus a once-only guard for fatal
/// log lines. Components below the pipeline log fatal conditions at debug
/// level only; this is where they are reported.
struct RequestScope {
    health: Arc<StorageHealth>,
    report: Option<HealthReport>,
    logged: HashSet<ErrorCode>,
}

impl RequestScope {
    fn new(health: Arc<StorageHealth>) -> Self {
        Self {
            health,
            report: None,
            logged: HashSet::new(),
        }
    }

    async fn storage_ok(&mut self) -> bool {
        if self.report.is_none() {
            self.report = Some(Arc::clone(&self.health).check_async().await);
        }
        self.report.as_ref().is_some_and(|report| report.ok)
    }

    fn fatal(&mut self, code: ErrorCode, form_id: &str, detail: &str) -> SubmitResult {
        if self.logged.insert(code) {
            error!(code = code.as_str(), form_id, detail, "Submission failed closed");
        }
        SubmitResult::error(code)
    }
}

/// Orchestrates a submission through the security stages.
pub struct SubmitPipeline {
    config: Arc<Config>,
    health: Arc<StorageHealth>,
    tokens: Arc<TokenStore>,
    ledger: Ledger,
    throttle: Arc<Throttle>,
    challenge: ChallengeVerifier,
    stages: Arc<dyn SubmissionStages>,
    metrics: Option<Metrics>,
}

impl SubmitPipeline {
    pub fn new(
        config: Arc<Config>,
        clock: Arc<dyn Clock>,
        stages: Arc<dyn SubmissionStages>,
    ) -> Result<Self, reqwest::Error> {
        let root = config.storage.root.clone();
        Ok(Self {
            health: Arc::new(StorageHealth::new(&root)),
            tokens: Arc::new(TokenStore::new(config.clone(), clock.clone())),
            ledger: Ledger::new(&root),
            throttle: Arc::new(Throttle::new(
                &root,
                config.throttle.clone(),
                config.gc.throttle_stale_seconds,
                clock,
            )),
            challenge: ChallengeVerifier::new(config.challenge.clone())?,
            stages,
            metrics: None,
            config,
        })
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn health(&self) -> &Arc<StorageHealth> {
        &self.health
    }

    pub fn tokens(&self) -> &Arc<TokenStore> {
        &self.tokens
    }

    pub fn throttle(&self) -> &Arc<Throttle> {
        &self.throttle
    }

    /// Run a submission through every stage.
    pub async fn submit(&self, request: &SubmitRequest) -> SubmitResult {
        let result = self.run(request).await;
        if let Some(metrics) = &self.metrics {
            metrics.submission(outcome_label(&result));
        }
        result
    }

    async fn run(&self, request: &SubmitRequest) -> SubmitResult {
        let security = &self.config.security;
        let form_id = request.form_id.as_str();

        if request.body_len > security.max_post_bytes {
            return SubmitResult::error(ErrorCode::Type);
        }
        if !is_valid_form_id(form_id) || !security.form_allowed(form_id) {
            return SubmitResult::error(ErrorCode::InvalidFormId);
        }

        let mut scope = RequestScope::new(Arc::clone(&self.health));
        if !scope.storage_ok().await {
            return scope.fatal(ErrorCode::StorageUnavailable, form_id, "storage_probe_failed");
        }

        if let Some(rejected) = self.check_throttle(request, &mut scope).await {
            return rejected;
        }

        let tokens = Arc::clone(&self.tokens);
        let owned = request.clone();
        let validation = match storage::run_blocking(move || tokens.validate(&security_input(&owned))).await {
            Ok(validation) => validation,
            Err(err) => {
                debug!(error = %err, "Token validation task failed");
                return scope.fatal(ErrorCode::StorageUnavailable, form_id, "token_task_failed");
            }
        };

        if honeypot_triggered(request.field(HONEYPOT_FIELD)) {
            if validation.token_ok {
                self.reserve(form_id, &validation.submission_id).await.ok();
            }
            info!(
                code = "EFORMS_ERR_HONEYPOT",
                form_id,
                ip = %client_ip::present_for_log(request.client_ip, &self.config.privacy),
                "Honeypot triggered"
            );
            return match security.honeypot_response {
                HoneypotResponse::HardFail => SubmitResult::error(ErrorCode::Honeypot)
                    .with_global_error("Form submission failed. Please try again."),
                HoneypotResponse::StealthSuccess => SubmitResult::accepted(None),
            };
        }

        if validation.hard_fail {
            let code = validation.error_code.unwrap_or(ErrorCode::Token);
            if code.is_fatal() {
                return scope.fatal(code, form_id, validation.reason);
            }
            return SubmitResult::error(code);
        }

        let mut ctx = SubmissionContext {
            form_id: form_id.to_string(),
            submission_id: validation.submission_id.clone(),
            mode: validation.mode,
            token_ok: validation.token_ok,
            suspect: is_suspect(&validation.soft_reasons, self.config.spam.soft_fail_threshold),
            soft_reasons: validation.soft_reasons,
            require_challenge: validation.require_challenge,
            fields: user_fields(&request.fields, self.challenge.response_field()),
        };

        let prepared = self.stages.prepare(&mut ctx).await;
        if !prepared.ok {
            return self.labelled(SubmitResult::from_outcome(prepared), &ctx);
        }

        let response = request
            .field(self.challenge.response_field())
            .map(str::trim)
            .unwrap_or("");
        if ctx.require_challenge || !response.is_empty() {
            let remote_ip = match self.config.privacy.ip_mode {
                IpMode::None => None,
                _ => Some(request.client_ip),
            };
            match self
                .challenge
                .verify(response, remote_ip, form_id, request.field(INSTANCE_FIELD))
                .await
            {
                ChallengeVerdict::Passed => {
                    ctx.soft_reasons.clear();
                    ctx.require_challenge = false;
                    ctx.suspect = false;
                }
                ChallengeVerdict::Failed(_) => {
                    return self.labelled(
                        SubmitResult::error(ErrorCode::ChallengeFailed)
                            .with_global_error("Please complete the verification and try again."),
                        &ctx,
                    );
                }
                ChallengeVerdict::Unconfigured => {
                    return scope.fatal(ErrorCode::ChallengeUnconfigured, form_id, "challenge_keys_missing");
                }
            }
        }

        if ctx.token_ok {
            match self.reserve(form_id, &ctx.submission_id).await {
                Ok(Reservation::Reserved) => {}
                Ok(Reservation::Duplicate) => {
                    info!(code = "EFORMS_ERR_TOKEN", form_id, reason = "duplicate", "Submission already processed");
                    return SubmitResult::error(ErrorCode::Token)
                        .with_global_error("This form was already submitted.");
                }
                Err(_) => return scope.fatal(ErrorCode::LedgerIo, form_id, "ledger_reserve_failed"),
            }
        } else {
            debug!(form_id, reason = validation.reason, "Proceeding without ledger reservation");
        }

        let committed = self.stages.commit(&ctx).await;
        if committed.ok {
            let mut result = SubmitResult::accepted(Some(ctx.submission_id.clone()));
            result.soft_reasons = ctx.soft_reasons;
            return result;
        }
        if committed.error_code == Some(ErrorCode::EmailSend) {
            return self.after_email_failure(committed, &ctx).await;
        }
        self.labelled(SubmitResult::from_outcome(committed), &ctx)
    }

    /// Throttle the client. `Some` carries the rejection.
    async fn check_throttle(
        &self,
        request: &SubmitRequest,
        scope: &mut RequestScope,
    ) -> Option<SubmitResult> {
        if !self.throttle.enabled() {
            return None;
        }
        let key = client_ip::throttle_key(request.client_ip, &self.config.privacy)?;
        let throttle = Arc::clone(&self.throttle);
        let decision = match blocking_store(move || throttle.check(&key)).await {
            Ok(decision) => decision,
            Err(err) => {
                debug!(error = %err, "Throttle check failed");
                return Some(scope.fatal(ErrorCode::StorageUnavailable, &request.form_id, "throttle_io"));
            }
        };
        if decision.allowed() {
            return None;
        }
        if let Some(metrics) = &self.metrics {
            metrics.throttle_rejected(&decision.state.to_string());
        }
        info!(
            code = "EFORMS_ERR_THROTTLED",
            form_id = %request.form_id,
            state = %decision.state,
            retry_after = decision.retry_after,
            ip = %client_ip::present_for_log(request.client_ip, &self.config.privacy),
            "Submission throttled"
        );
        let mut result = SubmitResult::error(ErrorCode::Throttled);
        result.retry_after = Some(decision.retry_after);
        Some(result)
    }

    async fn reserve(&self, form_id: &str, token: &str) -> StorageResult<Reservation> {
        let ledger = self.ledger.clone();
        let (form_id, token) = (form_id.to_string(), token.to_string());
        let result = blocking_store(move || ledger.reserve(&form_id, &token)).await;
        if let Some(metrics) = &self.metrics {
            let label = match &result {
                Ok(Reservation::Reserved) => "reserved",
                Ok(Reservation::Duplicate) => "duplicate",
                Err(_) => "io_error",
            };
            metrics.ledger_reservation(label);
        }
        result
    }

    /// Email failed after the ledger slot was spent; the old token is gone.
    async fn after_email_failure(&self, outcome: StageOutcome, ctx: &SubmissionContext) -> SubmitResult {
        let mut result = self.labelled(SubmitResult::from_outcome(outcome), ctx);
        if ctx.mode == TokenMode::Hidden {
            let tokens = Arc::clone(&self.tokens);
            let form_id = ctx.form_id.clone();
            match blocking_store(move || tokens.mint(&form_id, TokenMode::Hidden)).await {
                Ok(minted) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.token_minted(TokenMode::Hidden.as_str());
                    }
                    result.token = Some(minted);
                }
                Err(err) => {
                    warn!(form_id = %ctx.form_id, error = %err, "Re-mint after email failure failed");
                    result.remint_required = true;
                }
            }
        } else {
            result.remint_required = true;
        }
        result
    }

    fn labelled(&self, mut result: SubmitResult, ctx: &SubmissionContext) -> SubmitResult {
        result.soft_reasons = ctx.soft_reasons.clone();
        result
    }
}

/// Store call on the blocking pool; a failed task reads as unavailable
/// storage.
async fn blocking_store<T, F>(op: F) -> StorageResult<T>
where
    F: FnOnce() -> StorageResult<T> + Send + 'static,
    T: Send + 'static,
{
    storage::run_blocking(op)
        .await
        .unwrap_or_else(|err| Err(StorageError::Unavailable(format!("blocking task failed: {err}"))))
}

fn security_input(request: &SubmitRequest) -> SecurityInput<'_> {
    SecurityInput {
        form_id: &request.form_id,
        posted_token: request.field(TOKEN_FIELD),
        posted_instance_id: request.field(INSTANCE_FIELD),
        posted_mode: request.field(MODE_FIELD),
        cookie_token: request.cookie_token.as_deref(),
        js_ok: request.field(JS_OK_FIELD),
        email_retry: request.field(EMAIL_RETRY_FIELD).map(str::trim) == Some("1"),
        origin: request.origin.as_deref(),
        host: request.host.as_deref(),
    }
}

fn is_suspect(reasons: &SoftReasons, threshold: usize) -> bool {
    threshold > 0 && reasons.len() >= threshold
}

/// Strip the pipeline's own fields before handing the submission on.
fn user_fields(fields: &HashMap<String, String>, challenge_field: &str) -> HashMap<String, String> {
    const CONTROL: [&str; 6] = [
        TOKEN_FIELD,
        INSTANCE_FIELD,
        MODE_FIELD,
        HONEYPOT_FIELD,
        JS_OK_FIELD,
        EMAIL_RETRY_FIELD,
    ];
    fields
        .iter()
        .filter(|(name, _)| !CONTROL.contains(&name.as_str()) && name.as_str() != challenge_field)
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn outcome_label(result: &SubmitResult) -> &'static str {
    match (result.ok, result.error) {
        (true, _) => "accepted",
        (false, Some(ErrorCode::Throttled)) => "throttled",
        (false, Some(ErrorCode::Honeypot)) => "honeypot",
        (false, Some(ErrorCode::ChallengeFailed)) => "challenge_failed",
        (false, Some(code)) if code.is_fatal() => "error",
        (false, Some(_)) => "rejected",
        (false, None) => "invalid",
    }
}
