// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! HTTP handlers for the form submission guard.
//!
//! - `POST /eforms/mint`: JS-mode token minting
//! - `POST /eforms/submit/:form_id`: form submission through the pipeline
//! - `GET /health`, `GET /healthz`: liveness plus storage probe
//! - `GET <metrics.path>`: Prometheus text exposition

use crate::client_ip::{self, ClientIpResolver};
use crate::config::{Config, SecurityConfig};
use crate::error::ErrorCode;
use crate::metrics::Metrics;
use crate::pipeline::{SubmitPipeline, SubmitRequest};
use crate::signals::{origin_state, server_origin, OriginState};
use crate::storage::run_blocking;
use crate::token::{cookie_name, is_valid_form_id, TokenMode};
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

const NO_STORE: &str = "no-store, max-age=0";
const FORM_URLENCODED: &str = "application/x-www-form-urlencoded";

/// Shared application state.
pub struct AppState {
    pub config: Arc<Config>,
    pub pipeline: SubmitPipeline,
    pub resolver: ClientIpResolver,
    pub metrics: Option<Metrics>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Health check response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
    pub storage: &'static str,
}

/// Successful mint response.
#[derive(Debug, Serialize)]
pub struct MintResponse {
    pub token: String,
    pub instance_id: String,
    pub timestamp: i64,
    pub expires: i64,
}

/// Build the service router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/eforms/mint", any(mint))
        .route("/eforms/submit/:form_id", post(submit));
    if state.config.metrics.enabled && state.metrics.is_some() {
        router = router.route(&state.config.metrics.path, get(metrics));
    }
    if let Some(cors) = cors_layer(&state.config.security) {
        router = router.layer(cors);
    }
    router.layer(TraceLayer::new_for_http()).with_state(state)
}

/// Cross-origin access for the configured public origin only.
fn cors_layer(security: &SecurityConfig) -> Option<CorsLayer> {
    let origin: HeaderValue = security
        .public_origin
        .as_deref()?
        .trim()
        .trim_end_matches('/')
        .parse()
        .ok()?;
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::exact(origin))
            .allow_methods([Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

fn no_store(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static(NO_STORE));
    response
}

fn error_response(code: ErrorCode, retry_after: Option<u64>) -> Response {
    let mut response = (code.status(), Json(ErrorResponse { error: code, retry_after })).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    no_store(response)
}

fn header_str<'a>(headers: &'a HeaderMap, name: header::HeaderName) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_form_urlencoded(headers: &HeaderMap) -> bool {
    header_str(headers, header::CONTENT_TYPE)
        .and_then(|ct| ct.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case(FORM_URLENCODED))
        .unwrap_or(false)
}

fn declared_length(headers: &HeaderMap) -> Option<usize> {
    header_str(headers, header::CONTENT_LENGTH).and_then(|v| v.trim().parse().ok())
}

/// Read the body, refusing anything above `limit` bytes.
async fn read_body(headers: &HeaderMap, body: Body, limit: usize) -> Option<Bytes> {
    if declared_length(headers).is_some_and(|len| len > limit) {
        return None;
    }
    axum::body::to_bytes(body, limit).await.ok()
}

fn parse_form(bytes: &[u8]) -> HashMap<String, String> {
    url::form_urlencoded::parse(bytes).into_owned().collect()
}

fn cookie_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim().to_string())
}

fn remote_ip(connect: Option<ConnectInfo<SocketAddr>>) -> IpAddr {
    connect
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> Response {
    let report = Arc::clone(state.pipeline.health()).check_async().await;
    let (status, label) = if report.ok {
        (StatusCode::OK, "healthy")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    };
    let storage = if report.ok { "ok" } else { report.reason };
    (
        status,
        Json(HealthResponse {
            status: label,
            service: "eforms-guard",
            version: env!("CARGO_PKG_VERSION"),
            storage,
        }),
    )
        .into_response()
}

/// Prometheus scrape endpoint.
pub async fn metrics(State(state): State<Arc<AppState>>) -> Response {
    let Some(metrics) = &state.metrics else {
        return StatusCode::NOT_FOUND.into_response();
    };
    match metrics.encode() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(err) => {
            warn!(error = %err, "Metrics encoding failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Mint a JS-mode token.
///
/// Only same-origin, form-encoded POSTs naming an accepted form id get a
/// token. Every response carries `Cache-Control: no-store`.
pub async fn mint(
    State(state): State<Arc<AppState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    headers: HeaderMap,
    body: Body,
) -> Response {
    if method != Method::POST {
        let mut response = error_response(ErrorCode::MethodNotAllowed, None);
        response
            .headers_mut()
            .insert(header::ALLOW, HeaderValue::from_static("POST"));
        return response;
    }
    if !is_form_urlencoded(&headers) {
        return error_response(ErrorCode::Type, None);
    }

    let security = &state.config.security;
    let Some(bytes) = read_body(&headers, body, security.max_post_bytes).await else {
        return no_store(
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: ErrorCode::MintFailed,
                    retry_after: None,
                }),
            )
                .into_response(),
        );
    };

    let server = server_origin(
        security.public_origin.as_deref(),
        header_str(&headers, header::HOST),
    );
    let origin = origin_state(header_str(&headers, header::ORIGIN), server.as_ref());
    if origin != OriginState::Same {
        info!(code = "EFORMS_ERR_ORIGIN_FORBIDDEN", origin = ?origin, "Mint refused");
        return error_response(ErrorCode::OriginForbidden, None);
    }

    let client = state.resolver.resolve(remote_ip(connect), &headers);
    let throttle = state.pipeline.throttle();
    if throttle.enabled() {
        if let Some(key) = client_ip::throttle_key(client, &state.config.privacy) {
            let throttle = Arc::clone(throttle);
            match run_blocking(move || throttle.check(&key)).await {
                Ok(Ok(decision)) if decision.allowed() => {}
                Ok(Ok(decision)) => {
                    if let Some(metrics) = &state.metrics {
                        metrics.throttle_rejected(&decision.state.to_string());
                    }
                    info!(
                        code = "EFORMS_ERR_THROTTLED",
                        state = %decision.state,
                        ip = %client_ip::present_for_log(client, &state.config.privacy),
                        "Mint throttled"
                    );
                    return error_response(ErrorCode::Throttled, Some(decision.retry_after));
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "Throttle check failed during mint");
                    return error_response(ErrorCode::MintFailed, None);
                }
                Err(err) => {
                    warn!(error = %err, "Throttle task failed during mint");
                    return error_response(ErrorCode::MintFailed, None);
                }
            }
        }
    }

    let fields = parse_form(&bytes);
    let form_id = fields.get("f").map(|f| f.trim()).unwrap_or("");
    if !is_valid_form_id(form_id) || !security.form_allowed(form_id) {
        return error_response(ErrorCode::InvalidFormId, None);
    }

    let tokens = Arc::clone(state.pipeline.tokens());
    let owned_form_id = form_id.to_string();
    let minted = run_blocking(move || tokens.mint(&owned_form_id, TokenMode::Js)).await;
    match minted {
        Ok(Ok(minted)) => {
            if let Some(metrics) = &state.metrics {
                metrics.token_minted(TokenMode::Js.as_str());
            }
            debug!(form_id, "JS token minted");
            no_store(
                Json(MintResponse {
                    token: minted.token,
                    instance_id: minted.instance_id,
                    timestamp: minted.issued_at,
                    expires: minted.expires,
                })
                .into_response(),
            )
        }
        Ok(Err(err)) => {
            warn!(code = "EFORMS_ERR_MINT_FAILED", form_id, error = %err, "Token mint failed");
            error_response(ErrorCode::MintFailed, None)
        }
        Err(err) => {
            warn!(code = "EFORMS_ERR_MINT_FAILED", form_id, error = %err, "Token mint task failed");
            error_response(ErrorCode::MintFailed, None)
        }
    }
}

/// Accept a form submission.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(form_id): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let limit = state.config.security.max_post_bytes;
    if !is_form_urlencoded(&headers) {
        return error_response(ErrorCode::Type, None);
    }
    let Some(bytes) = read_body(&headers, body, limit).await else {
        return error_response(ErrorCode::Type, None);
    };

    let request = SubmitRequest {
        cookie_token: cookie_value(&headers, &cookie_name(&form_id)),
        form_id,
        fields: parse_form(&bytes),
        origin: header_str(&headers, header::ORIGIN).map(String::from),
        host: header_str(&headers, header::HOST).map(String::from),
        client_ip: state.resolver.resolve(remote_ip(connect), &headers),
        body_len: bytes.len(),
    };

    let result = state.pipeline.submit(&request).await;
    let retry_after = result.retry_after;
    let mut response = (result.status, Json(result)).into_response();
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    no_store(response)
}
