// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Error types and the stable `EFORMS_*` code surface.

use axum::http::StatusCode;
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

/// Stable error codes returned to clients. Append-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorCode {
    #[serde(rename = "EFORMS_ERR_TOKEN")]
    Token,
    #[serde(rename = "EFORMS_ERR_HONEYPOT")]
    Honeypot,
    #[serde(rename = "EFORMS_ERR_ORIGIN_FORBIDDEN")]
    OriginForbidden,
    #[serde(rename = "EFORMS_ERR_THROTTLED")]
    Throttled,
    #[serde(rename = "EFORMS_ERR_CHALLENGE_FAILED")]
    ChallengeFailed,
    #[serde(rename = "EFORMS_CHALLENGE_UNCONFIGURED")]
    ChallengeUnconfigured,
    #[serde(rename = "EFORMS_ERR_STORAGE_UNAVAILABLE")]
    StorageUnavailable,
    #[serde(rename = "EFORMS_ERR_LEDGER_IO")]
    LedgerIo,
    #[serde(rename = "EFORMS_ERR_TYPE")]
    Type,
    #[serde(rename = "EFORMS_ERR_INVALID_FORM_ID")]
    InvalidFormId,
    #[serde(rename = "EFORMS_ERR_MINT_FAILED")]
    MintFailed,
    #[serde(rename = "EFORMS_ERR_METHOD_NOT_ALLOWED")]
    MethodNotAllowed,
    #[serde(rename = "EFORMS_ERR_EMAIL_SEND")]
    EmailSend,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Token => "EFORMS_ERR_TOKEN",
            Self::Honeypot => "EFORMS_ERR_HONEYPOT",
            Self::OriginForbidden => "EFORMS_ERR_ORIGIN_FORBIDDEN",
            Self::Throttled => "EFORMS_ERR_THROTTLED",
            Self::ChallengeFailed => "EFORMS_ERR_CHALLENGE_FAILED",
            Self::ChallengeUnconfigured => "EFORMS_CHALLENGE_UNCONFIGURED",
            Self::StorageUnavailable => "EFORMS_ERR_STORAGE_UNAVAILABLE",
            Self::LedgerIo => "EFORMS_ERR_LEDGER_IO",
            Self::Type => "EFORMS_ERR_TYPE",
            Self::InvalidFormId => "EFORMS_ERR_INVALID_FORM_ID",
            Self::MintFailed => "EFORMS_ERR_MINT_FAILED",
            Self::MethodNotAllowed => "EFORMS_ERR_METHOD_NOT_ALLOWED",
            Self::EmailSend => "EFORMS_ERR_EMAIL_SEND",
        }
    }

    /// Default HTTP status for the code.
    ///
    /// Rerender outcomes (honeypot, challenge, email) are `200` so the
    /// client can read the `errors` body and redisplay the form.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Token | Self::Type | Self::InvalidFormId => StatusCode::BAD_REQUEST,
            Self::Honeypot | Self::ChallengeFailed | Self::EmailSend => StatusCode::OK,
            Self::OriginForbidden => StatusCode::FORBIDDEN,
            Self::Throttled => StatusCode::TOO_MANY_REQUESTS,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::ChallengeUnconfigured
            | Self::StorageUnavailable
            | Self::LedgerIo
            | Self::MintFailed => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Infrastructure failures that are logged once per request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::ChallengeUnconfigured | Self::StorageUnavailable | Self::LedgerIo
        )
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by the on-disk stores.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("corrupt record at {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),
}

impl StorageError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;
