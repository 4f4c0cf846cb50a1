// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: Apache-2.0

//! Service fixtures over a temporary storage root.

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{header, HeaderMap, Request, StatusCode},
    Router,
};
use eforms_guard::{
    client_ip::ClientIpResolver,
    clock::ManualClock,
    config::Config,
    handlers::{build_router, AppState},
    metrics::Metrics,
    pipeline::{PassthroughStages, SubmitPipeline, SubmitRequest},
    storage::PrivateDir,
    token::{MintedToken, TokenMode, INSTANCE_FIELD, MODE_FIELD, TOKEN_FIELD},
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

pub const SITE_HOST: &str = "forms.example.org";
pub const SITE_ORIGIN: &str = "http://forms.example.org";
pub const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";
pub const FORM_ID: &str = "contact";

/// A running service without a socket.
pub struct TestApp {
    pub dir: TempDir,
    pub config: Arc<Config>,
    pub clock: Arc<ManualClock>,
    pub metrics: Metrics,
    pub state: Arc<AppState>,
}

/// Status, headers and decoded body of a routed request.
#[derive(Debug)]
pub struct TestResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub text: String,
    pub json: serde_json::Value,
}

impl TestResponse {
    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn error(&self) -> Option<&str> {
        self.json.get("error").and_then(|v| v.as_str())
    }
}

impl TestApp {
    pub fn new(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.storage.root = dir.path().to_path_buf();
        config.gc.interval_seconds = 0;
        tweak(&mut config);
        let config = Arc::new(config);
        let clock = Arc::new(ManualClock::starting_now());
        let metrics = Metrics::new().expect("metrics registry");

        let pipeline = SubmitPipeline::new(config.clone(), clock.clone(), Arc::new(PassthroughStages))
            .expect("pipeline")
            .with_metrics(metrics.clone());
        let state = Arc::new(AppState {
            config: config.clone(),
            pipeline,
            resolver: ClientIpResolver::new(&config.privacy),
            metrics: Some(metrics.clone()),
        });

        Self {
            dir,
            config,
            clock,
            metrics,
            state,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    pub async fn send(&self, request: Request<Body>) -> TestResponse {
        let response = self.router().oneshot(request).await.expect("routed");
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        TestResponse {
            status,
            headers,
            text,
            json,
        }
    }

    /// Reservation markers currently in the ledger.
    pub fn ledger_entries(&self) -> usize {
        count_files(&PrivateDir::at(&self.config.storage.root).ledger_dir())
    }

    pub fn mint(&self, mode: TokenMode) -> MintedToken {
        self.state
            .pipeline
            .tokens()
            .mint(FORM_ID, mode)
            .expect("mint")
    }
}

/// Regular files below `dir`, recursively.
pub fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .map(|entry| {
                    let path = entry.path();
                    if path.is_dir() {
                        count_files(&path)
                    } else {
                        1
                    }
                })
                .sum()
        })
        .unwrap_or(0)
}

/// A same-origin form POST from `ip`; headers can still be added.
pub fn form_request(uri: &str, ip: IpAddr) -> axum::http::request::Builder {
    request_from(uri, ip, SITE_ORIGIN, FORM_URLENCODED)
}

/// A POST from `ip` with the given Origin and Content-Type headers.
pub fn request_from(
    uri: &str,
    ip: IpAddr,
    origin: &str,
    content_type: &str,
) -> axum::http::request::Builder {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::HOST, SITE_HOST)
        .header(header::ORIGIN, origin)
        .header(header::CONTENT_TYPE, content_type)
        .extension(ConnectInfo(SocketAddr::new(ip, 41_000)))
}

pub fn encode_form(pairs: &[(&str, &str)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish()
}

/// Form fields carrying a minted token.
pub fn token_fields(minted: &MintedToken) -> Vec<(String, String)> {
    vec![
        (TOKEN_FIELD.to_string(), minted.token.clone()),
        (INSTANCE_FIELD.to_string(), minted.instance_id.clone()),
        (MODE_FIELD.to_string(), minted.mode.as_str().to_string()),
        ("js_ok".to_string(), "1".to_string()),
        ("email".to_string(), "visitor@example.net".to_string()),
        ("message".to_string(), "Hello there".to_string()),
    ]
}

/// A direct pipeline submission from `ip`.
pub fn submission(minted: Option<&MintedToken>, ip: IpAddr) -> SubmitRequest {
    let mut fields: HashMap<String, String> = match minted {
        Some(minted) => token_fields(minted).into_iter().collect(),
        None => HashMap::new(),
    };
    fields
        .entry("email".to_string())
        .or_insert_with(|| "visitor@example.net".to_string());
    SubmitRequest {
        form_id: FORM_ID.to_string(),
        fields,
        cookie_token: None,
        origin: Some(SITE_ORIGIN.to_string()),
        host: Some(SITE_HOST.to_string()),
        client_ip: ip,
        body_len: 256,
    }
}
