// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Submission token store.
//!
//! Tokens are version-4 UUIDs. Each minted token is persisted as a small
//! JSON record at `tokens/<h2>/<sha256(token)>.json`; the raw token is never
//! written to disk. Validation reads the record back and runs the origin and
//! timing signals to produce a [`TokenValidation`].

use crate::clock::Clock;
use crate::config::{ChallengeMode, Config, CookieMissingPolicy};
use crate::error::{ErrorCode, StorageError, StorageResult};
use crate::signals::{
    evaluate_origin, evaluate_timing, origin_state, server_origin, OriginState, SoftReasons,
    TimingInput,
};
use crate::storage::{self, PrivateDir};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// POST field carrying the token in hidden and JS modes.
pub const TOKEN_FIELD: &str = "eforms_token";
/// POST field carrying the render instance id.
pub const INSTANCE_FIELD: &str = "instance_id";
/// POST field naming the token mode.
pub const MODE_FIELD: &str = "eforms_mode";

const INSTANCE_ID_BYTES: usize = 16;

/// Cookie name carrying the token in cookie mode.
pub fn cookie_name(form_id: &str) -> String {
    format!("eforms_t_{form_id}")
}

/// How the token reached the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenMode {
    Hidden,
    Cookie,
    Js,
}

impl TokenMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "hidden" => Some(Self::Hidden),
            "cookie" => Some(Self::Cookie),
            "js" => Some(Self::Js),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::Cookie => "cookie",
            Self::Js => "js",
        }
    }
}

/// Persisted token record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub mode: TokenMode,
    pub form_id: String,
    pub instance_id: String,
    pub issued_at: i64,
    pub expires: i64,
}

/// A freshly minted token handed to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MintedToken {
    pub token: String,
    pub instance_id: String,
    pub issued_at: i64,
    pub expires: i64,
    pub mode: TokenMode,
}

/// Request-side inputs to token validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SecurityInput<'a> {
    pub form_id: &'a str,
    pub posted_token: Option<&'a str>,
    pub posted_instance_id: Option<&'a str>,
    pub posted_mode: Option<&'a str>,
    pub cookie_token: Option<&'a str>,
    pub js_ok: Option<&'a str>,
    pub email_retry: bool,
    pub origin: Option<&'a str>,
    pub host: Option<&'a str>,
}

/// Outcome of token validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenValidation {
    pub mode: TokenMode,
    /// Ledger identity; the token itself when `token_ok`
    pub submission_id: String,
    pub token_ok: bool,
    pub hard_fail: bool,
    pub error_code: Option<ErrorCode>,
    /// Machine-readable detail for logs
    pub reason: &'static str,
    pub soft_reasons: SoftReasons,
    pub require_challenge: bool,
    pub origin_state: OriginState,
}

impl TokenValidation {
    fn hard(mode: TokenMode, code: ErrorCode, reason: &'static str) -> Self {
        Self {
            mode,
            submission_id: String::new(),
            token_ok: false,
            hard_fail: true,
            error_code: Some(code),
            reason,
            soft_reasons: SoftReasons::new(),
            require_challenge: false,
            origin_state: OriginState::Unknown,
        }
    }
}

/// Form ids are path components, so keep them to a conservative alphabet.
pub fn is_valid_form_id(form_id: &str) -> bool {
    !form_id.is_empty()
        && form_id.len() <= 64
        && form_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Canonical lowercase v4 UUID syntax.
pub fn is_valid_token(token: &str) -> bool {
    token.len() == 36
        && Uuid::try_parse(token)
            .map(|u| u.get_version_num() == 4)
            .unwrap_or(false)
}

pub fn is_valid_instance_id(instance_id: &str) -> bool {
    (22..=32).contains(&instance_id.len())
        && instance_id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn sha256_hex(input: &str) -> String {
    hex::encode(Sha256::digest(input.as_bytes()))
}

fn generate_instance_id() -> String {
    let mut bytes = [0u8; INSTANCE_ID_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Mints and validates submission tokens.
pub struct TokenStore {
    root: PathBuf,
    config: Arc<Config>,
    clock: Arc<dyn Clock>,
}

impl TokenStore {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>) -> Self {
        Self {
            root: config.storage.root.clone(),
            config,
            clock,
        }
    }

    fn record_path(&self, token: &str) -> PathBuf {
        let hash = sha256_hex(token);
        PrivateDir::at(&self.root)
            .tokens_dir()
            .join(storage::h2(&hash))
            .join(format!("{hash}.json"))
    }

    /// Mint a token for `form_id` and persist its record.
    pub fn mint(&self, form_id: &str, mode: TokenMode) -> StorageResult<MintedToken> {
        if !is_valid_form_id(form_id) {
            return Err(StorageError::InvalidInput("form_id"));
        }
        PrivateDir::ensure(&self.root)?;

        let token = Uuid::new_v4().to_string();
        let instance_id = generate_instance_id();
        let issued_at = self.clock.now();
        let expires = issued_at + self.config.security.token_ttl_seconds as i64;
        let record = TokenRecord {
            mode,
            form_id: form_id.to_string(),
            instance_id: instance_id.clone(),
            issued_at,
            expires,
        };

        let path = self.record_path(&token);
        let shard = path
            .parent()
            .ok_or(StorageError::InvalidInput("token path"))?;
        let body = serde_json::to_vec(&record).map_err(|e| StorageError::Corrupt {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        storage::in_shard(shard, || storage::write_atomic(&path, &body))?;

        debug!(form_id, mode = mode.as_str(), expires, "Token minted");
        Ok(MintedToken {
            token,
            instance_id,
            issued_at,
            expires,
            mode,
        })
    }

    /// Read the record for a token. `Ok(None)` when no record exists.
    pub fn read_record(&self, token: &str) -> StorageResult<Option<TokenRecord>> {
        let path = self.record_path(token);
        let raw = match std::fs::read(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io(&path, err)),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| StorageError::Corrupt {
                path,
                reason: e.to_string(),
            })
    }

    fn challenge_required(&self, soft_reasons: &SoftReasons) -> bool {
        match self.config.challenge.mode {
            ChallengeMode::Off => false,
            ChallengeMode::AlwaysPost => true,
            ChallengeMode::Auto => !soft_reasons.is_empty(),
        }
    }

    /// Validate the token carried by a submission.
    pub fn validate(&self, input: &SecurityInput<'_>) -> TokenValidation {
        let result = self.validate_inner(input);
        // Fatal codes are reported once by the pipeline
        let fatal = result.error_code.is_some_and(|c| c.is_fatal());
        if result.hard_fail && !fatal {
            info!(
                code = result.error_code.map(|c| c.as_str()).unwrap_or("EFORMS_ERR_TOKEN"),
                reason = result.reason,
                form_id = input.form_id,
                mode = result.mode.as_str(),
                "Token validation failed"
            );
        }
        result
    }

    fn validate_inner(&self, input: &SecurityInput<'_>) -> TokenValidation {
        let posted_token = non_empty(input.posted_token);
        let mode = match non_empty(input.posted_mode) {
            Some(raw) => match TokenMode::parse(raw) {
                Some(mode) => mode,
                None => {
                    return TokenValidation::hard(TokenMode::Hidden, ErrorCode::Token, "mode_invalid")
                }
            },
            None if posted_token.is_some() => TokenMode::Hidden,
            None => TokenMode::Cookie,
        };
        let token = match mode {
            TokenMode::Hidden | TokenMode::Js => posted_token,
            TokenMode::Cookie => non_empty(input.cookie_token).or(posted_token),
        };

        let token = match token {
            Some(token) => token,
            None if mode == TokenMode::Cookie => return self.without_token(input),
            None => return TokenValidation::hard(mode, ErrorCode::Token, "token_missing"),
        };

        if !is_valid_token(token) {
            return TokenValidation::hard(mode, ErrorCode::Token, "token_malformed");
        }
        let posted_instance = non_empty(input.posted_instance_id);
        match posted_instance {
            Some(id) if !is_valid_instance_id(id) => {
                return TokenValidation::hard(mode, ErrorCode::Token, "instance_id_malformed")
            }
            None if mode != TokenMode::Cookie => {
                return TokenValidation::hard(mode, ErrorCode::Token, "instance_id_missing")
            }
            _ => {}
        }

        let record = match self.read_record(token) {
            Ok(Some(record)) => record,
            Ok(None) => return TokenValidation::hard(mode, ErrorCode::Token, "record_missing"),
            Err(StorageError::Corrupt { .. }) => {
                return TokenValidation::hard(mode, ErrorCode::Token, "record_corrupt")
            }
            Err(err) => {
                debug!(error = %err, "Token record unreadable");
                return TokenValidation::hard(mode, ErrorCode::StorageUnavailable, "record_unreadable");
            }
        };

        if record.form_id != input.form_id {
            return TokenValidation::hard(mode, ErrorCode::Token, "form_id_mismatch");
        }
        if record.expires <= record.issued_at {
            return TokenValidation::hard(mode, ErrorCode::Token, "record_invalid");
        }
        if record.mode != mode {
            return TokenValidation::hard(mode, ErrorCode::Token, "mode_mismatch");
        }
        if let Some(id) = posted_instance {
            if id != record.instance_id {
                return TokenValidation::hard(mode, ErrorCode::Token, "instance_id_mismatch");
            }
        }
        let now = self.clock.now();
        if record.expires <= now {
            return TokenValidation::hard(mode, ErrorCode::Token, "expired");
        }

        let mut result = match self.evaluate_signals(input, Some(record.issued_at), now) {
            Ok(result) => result,
            Err(hard) => return TokenValidation { mode, ..hard },
        };
        result.mode = mode;
        result.submission_id = token.to_string();
        result.token_ok = true;
        result
    }

    /// No token anywhere; the cookie-missing policy decides.
    fn without_token(&self, input: &SecurityInput<'_>) -> TokenValidation {
        let policy = self.config.security.cookie_missing_policy;
        if policy == CookieMissingPolicy::Hard {
            return TokenValidation::hard(TokenMode::Cookie, ErrorCode::Token, "cookie_missing");
        }
        let mut result = match self.evaluate_signals(input, None, self.clock.now()) {
            Ok(result) => result,
            Err(hard) => return hard,
        };
        result.submission_id = Uuid::new_v4().to_string();
        result.reason = "cookie_missing";
        if policy == CookieMissingPolicy::Challenge {
            result.require_challenge = true;
        }
        result
    }

    /// Origin and timing signals. `Err` carries a hard failure.
    fn evaluate_signals(
        &self,
        input: &SecurityInput<'_>,
        issued_at: Option<i64>,
        now: i64,
    ) -> Result<TokenValidation, TokenValidation> {
        let security = &self.config.security;

        let server = server_origin(security.public_origin.as_deref(), input.host);
        let state = origin_state(input.origin, server.as_ref());
        let origin = evaluate_origin(security, state);
        if origin.hard_fail {
            let mut hard =
                TokenValidation::hard(TokenMode::Cookie, ErrorCode::OriginForbidden, "origin_forbidden");
            hard.origin_state = state;
            return Err(hard);
        }

        let timing = evaluate_timing(
            security,
            TimingInput {
                issued_at,
                now,
                js_ok: input.js_ok,
                email_retry: input.email_retry,
            },
        );
        if timing.hard_fail {
            return Err(TokenValidation::hard(TokenMode::Cookie, ErrorCode::Token, "js_required"));
        }

        let mut soft_reasons = timing.soft_reasons;
        soft_reasons.extend(&origin.soft_reasons);
        let require_challenge = self.challenge_required(&soft_reasons);

        Ok(TokenValidation {
            mode: TokenMode::Cookie,
            submission_id: String::new(),
            token_ok: false,
            hard_fail: false,
            error_code: None,
            reason: "",
            soft_reasons,
            require_challenge,
            origin_state: state,
        })
    }
}
