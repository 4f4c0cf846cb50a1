// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Challenge (CAPTCHA) verification against the provider's siteverify API.
//!
//! Transport problems never escape this module: timeouts, non-2xx answers
//! and undecodable bodies all become [`ChallengeVerdict::Failed`]. Missing
//! keys are reported as [`ChallengeVerdict::Unconfigured`] without any
//! network traffic.

use crate::config::ChallengeConfig;
use serde::Deserialize;
use std::net::IpAddr;
use tracing::{debug, info};

/// Result of a verification attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeVerdict {
    Passed,
    /// Carries a short machine-readable reason
    Failed(&'static str),
    /// Site or secret key missing; nothing could be verified
    Unconfigured,
}

impl ChallengeVerdict {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Passed)
    }
}

/// Provider response body. Only `success` matters; error codes are logged.
#[derive(Debug, Deserialize)]
struct SiteverifyResponse {
    #[serde(default)]
    success: bool,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// HTTP client for the configured challenge provider.
#[derive(Debug, Clone)]
pub struct ChallengeVerifier {
    client: reqwest::Client,
    config: ChallengeConfig,
}

impl ChallengeVerifier {
    pub fn new(config: ChallengeConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client, config })
    }

    pub fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    /// Name of the POST field holding the widget response.
    pub fn response_field(&self) -> &'static str {
        self.config.provider.response_field()
    }

    /// Verify a widget response token.
    pub async fn verify(
        &self,
        response: &str,
        remote_ip: Option<IpAddr>,
        form_id: &str,
        instance_id: Option<&str>,
    ) -> ChallengeVerdict {
        if !self.config.is_configured() {
            // Fatal; the pipeline reports it once per request
            debug!(provider = %self.config.provider, form_id, "Challenge keys missing");
            return ChallengeVerdict::Unconfigured;
        }
        let response = response.trim();
        if response.is_empty() {
            return ChallengeVerdict::Failed("missing_response");
        }

        let verdict = self.call_provider(response, remote_ip).await;
        match &verdict {
            ChallengeVerdict::Passed => debug!(form_id, instance_id, "Challenge passed"),
            ChallengeVerdict::Failed(reason) => info!(
                code = "EFORMS_ERR_CHALLENGE_FAILED",
                provider = %self.config.provider,
                reason,
                form_id,
                instance_id,
                "Challenge verification failed"
            ),
            ChallengeVerdict::Unconfigured => {}
        }
        verdict
    }

    async fn call_provider(&self, response: &str, remote_ip: Option<IpAddr>) -> ChallengeVerdict {
        let mut params = vec![
            ("secret", self.config.secret_key.trim().to_string()),
            ("response", response.to_string()),
        ];
        if let Some(ip) = remote_ip {
            params.push(("remoteip", ip.to_string()));
        }
        if self.config.provider == crate::config::ChallengeProvider::Hcaptcha {
            params.push(("sitekey", self.config.site_key.trim().to_string()));
        }

        let http = match self
            .client
            .post(self.config.endpoint())
            .form(&params)
            .send()
            .await
        {
            Ok(http) => http,
            Err(err) if err.is_timeout() => return ChallengeVerdict::Failed("timeout"),
            Err(err) => {
                debug!(error = %err, "Challenge provider unreachable");
                return ChallengeVerdict::Failed("http_error");
            }
        };

        if !http.status().is_success() {
            return ChallengeVerdict::Failed("http_status");
        }

        let body = match http.json::<SiteverifyResponse>().await {
            Ok(body) => body,
            Err(_) => return ChallengeVerdict::Failed("decode_failed"),
        };
        if body.success {
            ChallengeVerdict::Passed
        } else {
            debug!(error_codes = ?body.error_codes, "Challenge provider rejected response");
            ChallengeVerdict::Failed("provider_rejected")
        }
    }
}
