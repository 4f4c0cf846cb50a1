// SPDX-FileCopyrightText: 2025 Hyperpolymath
// SPDX-License-Identifier: PMPL-1.0-or-later

//! Configuration for the form submission guard.
//!
//! The configuration is loaded once at start-up and handed to every
//! component as an immutable value. Numeric settings are clamped to their
//! supported ranges in [`Config::normalized`]; each clamp is logged with the
//! `EFORMS_CONFIG_CLAMPED` code.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration for the form submission guard service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server bind address (default: 0.0.0.0:8080)
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Storage configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Token, origin, timing and honeypot policy
    #[serde(default)]
    pub security: SecurityConfig,

    /// Soft-fail scoring
    #[serde(default)]
    pub spam: SpamConfig,

    /// Challenge (CAPTCHA) configuration
    #[serde(default)]
    pub challenge: ChallengeConfig,

    /// Per-client throttling
    #[serde(default)]
    pub throttle: ThrottleConfig,

    /// Client IP handling
    #[serde(default)]
    pub privacy: PrivacyConfig,

    /// Upload retention
    #[serde(default)]
    pub uploads: UploadsConfig,

    /// Garbage collection windows
    #[serde(default)]
    pub gc: GcConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Where on-disk state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory; the private directory is created beneath it.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginMode {
    Off,
    Soft,
    Hard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoneypotResponse {
    StealthSuccess,
    HardFail,
}

/// What to do when a submission arrives without any token at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CookieMissingPolicy {
    Hard,
    Soft,
    Challenge,
    Off,
}

/// Token and request-signal policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_origin_mode")]
    pub origin_mode: OriginMode,

    /// Treat a missing Origin header as a hard failure in hard mode
    #[serde(default)]
    pub origin_missing_hard: bool,

    /// Public origin of the site, e.g. `https://example.org`. When unset the
    /// request's Host header is used with an `http` scheme.
    #[serde(default)]
    pub public_origin: Option<String>,

    #[serde(default = "default_honeypot_response")]
    pub honeypot_response: HoneypotResponse,

    /// Minimum seconds between render and submit (0 disables)
    #[serde(default)]
    pub min_fill_seconds: u64,

    /// Token lifetime in seconds (default: 3600)
    #[serde(default = "default_token_ttl")]
    pub token_ttl_seconds: u64,

    /// Form age advisory threshold; defaults to the token lifetime
    #[serde(default)]
    pub max_form_age_seconds: Option<u64>,

    /// Reject submissions without the JS marker instead of soft-failing
    #[serde(default)]
    pub js_hard_mode: bool,

    /// Maximum accepted request body in bytes
    #[serde(default = "default_max_post_bytes")]
    pub max_post_bytes: usize,

    #[serde(default = "default_cookie_missing_policy")]
    pub cookie_missing_policy: CookieMissingPolicy,

    /// Allow-list of form ids. Empty means any well-formed id.
    #[serde(default)]
    pub forms: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpamConfig {
    /// Soft reasons needed before a submission is marked suspect
    #[serde(default = "default_soft_fail_threshold")]
    pub soft_fail_threshold: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeMode {
    Off,
    Auto,
    #[serde(alias = "always")]
    AlwaysPost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeProvider {
    Turnstile,
    Hcaptcha,
    Recaptcha,
}

impl ChallengeProvider {
    /// Default siteverify endpoint for the provider.
    pub fn verify_url(&self) -> &'static str {
        match self {
            Self::Turnstile => "https://challenges.cloudflare.com/turnstile/v0/siteverify",
            Self::Hcaptcha => "https://hcaptcha.com/siteverify",
            Self::Recaptcha => "https://www.google.com/recaptcha/api/siteverify",
        }
    }

    /// Name of the POST field the provider widget writes its response into.
    pub fn response_field(&self) -> &'static str {
        match self {
            Self::Turnstile => "cf-turnstile-response",
            Self::Hcaptcha => "h-captcha-response",
            Self::Recaptcha => "g-recaptcha-response",
        }
    }
}

impl std::fmt::Display for ChallengeProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Turnstile => write!(f, "turnstile"),
            Self::Hcaptcha => write!(f, "hcaptcha"),
            Self::Recaptcha => write!(f, "recaptcha"),
        }
    }
}

/// Challenge verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengeConfig {
    #[serde(default = "default_challenge_mode")]
    pub mode: ChallengeMode,

    #[serde(default = "default_challenge_provider")]
    pub provider: ChallengeProvider,

    #[serde(default)]
    pub site_key: String,

    #[serde(default)]
    pub secret_key: String,

    /// Provider call timeout in seconds (default: 3, range 1..=5)
    #[serde(default = "default_challenge_timeout")]
    pub http_timeout_seconds: u64,

    /// Override for the provider's siteverify URL
    #[serde(default)]
    pub verify_url: Option<String>,
}

/// Throttle configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default)]
    pub enable: bool,

    /// Requests per 60 second window before a key is `over` (default: 30)
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,

    /// Cooldown applied on entering `over` (default: 0)
    #[serde(default)]
    pub cooldown_seconds: u64,

    /// `hard` threshold as a multiple of `max_per_minute` (default: 3x)
    #[serde(default = "default_hard_multiplier")]
    pub hard_multiplier: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpMode {
    None,
    Masked,
    Hash,
    Full,
}

/// Client IP resolution and presentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_ip_mode")]
    pub ip_mode: IpMode,

    /// Header carrying the client IP when the peer is a trusted proxy
    #[serde(default)]
    pub client_ip_header: Option<String>,

    /// CIDR ranges of trusted proxies
    #[serde(default)]
    pub trusted_proxies: Vec<String>,

    #[serde(default)]
    pub ip_hash_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadsConfig {
    /// Upload retention in seconds (0 disables upload sweeping)
    #[serde(default)]
    pub retention_seconds: u64,
}

/// GC eligibility windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcConfig {
    #[serde(default = "default_token_ttl_max")]
    pub token_ttl_max_seconds: u64,

    #[serde(default = "default_ledger_grace")]
    pub ledger_grace_seconds: u64,

    /// Throttle files untouched for this long are removed (default: 2 days)
    #[serde(default = "default_throttle_stale")]
    pub throttle_stale_seconds: u64,

    /// Files examined per pass (default: 500)
    #[serde(default = "default_batch_limit")]
    pub batch_limit: usize,

    /// Interval of the background pass under `serve` (0 disables)
    #[serde(default = "default_gc_interval")]
    pub interval_seconds: u64,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable Prometheus metrics endpoint (default: true)
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics endpoint path (default: /metrics)
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

/// Configuration loading failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

pub const TOKEN_TTL_MIN: u64 = 1;
pub const TOKEN_TTL_MAX: u64 = 86400;
pub const MIN_FILL_MAX: u64 = 60;
pub const MAX_FORM_AGE_MIN: u64 = 1;
pub const MAX_FORM_AGE_MAX: u64 = 86400;
pub const CHALLENGE_TIMEOUT_MIN: u64 = 1;
pub const CHALLENGE_TIMEOUT_MAX: u64 = 5;
pub const MAX_PER_MINUTE_MIN: u32 = 1;
pub const MAX_PER_MINUTE_MAX: u32 = 120;
pub const COOLDOWN_MAX: u64 = 600;

// Default value functions
fn default_bind_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/eforms")
}

fn default_origin_mode() -> OriginMode {
    OriginMode::Soft
}

fn default_honeypot_response() -> HoneypotResponse {
    HoneypotResponse::StealthSuccess
}

fn default_token_ttl() -> u64 {
    3600
}

fn default_max_post_bytes() -> usize {
    1024 * 1024
}

fn default_cookie_missing_policy() -> CookieMissingPolicy {
    CookieMissingPolicy::Soft
}

fn default_soft_fail_threshold() -> usize {
    2
}

fn default_challenge_mode() -> ChallengeMode {
    ChallengeMode::Off
}

fn default_challenge_provider() -> ChallengeProvider {
    ChallengeProvider::Turnstile
}

fn default_challenge_timeout() -> u64 {
    3
}

fn default_max_per_minute() -> u32 {
    30
}

fn default_hard_multiplier() -> f32 {
    3.0
}

fn default_ip_mode() -> IpMode {
    IpMode::Masked
}

fn default_token_ttl_max() -> u64 {
    TOKEN_TTL_MAX
}

fn default_ledger_grace() -> u64 {
    3600
}

fn default_throttle_stale() -> u64 {
    172_800
}

fn default_batch_limit() -> usize {
    500
}

fn default_gc_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            spam: SpamConfig::default(),
            challenge: ChallengeConfig::default(),
            throttle: ThrottleConfig::default(),
            privacy: PrivacyConfig::default(),
            uploads: UploadsConfig::default(),
            gc: GcConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            origin_mode: default_origin_mode(),
            origin_missing_hard: false,
            public_origin: None,
            honeypot_response: default_honeypot_response(),
            min_fill_seconds: 0,
            token_ttl_seconds: default_token_ttl(),
            max_form_age_seconds: None,
            js_hard_mode: false,
            max_post_bytes: default_max_post_bytes(),
            cookie_missing_policy: default_cookie_missing_policy(),
            forms: Vec::new(),
        }
    }
}

impl Default for SpamConfig {
    fn default() -> Self {
        Self {
            soft_fail_threshold: default_soft_fail_threshold(),
        }
    }
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            mode: default_challenge_mode(),
            provider: default_challenge_provider(),
            site_key: String::new(),
            secret_key: String::new(),
            http_timeout_seconds: default_challenge_timeout(),
            verify_url: None,
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enable: false,
            max_per_minute: default_max_per_minute(),
            cooldown_seconds: 0,
            hard_multiplier: default_hard_multiplier(),
        }
    }
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            ip_mode: default_ip_mode(),
            client_ip_header: None,
            trusted_proxies: Vec::new(),
            ip_hash_salt: String::new(),
        }
    }
}

impl Default for UploadsConfig {
    fn default() -> Self {
        Self {
            retention_seconds: 0,
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            token_ttl_max_seconds: default_token_ttl_max(),
            ledger_grace_seconds: default_ledger_grace(),
            throttle_stale_seconds: default_throttle_stale(),
            batch_limit: default_batch_limit(),
            interval_seconds: default_gc_interval(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            path: default_metrics_path(),
        }
    }
}

impl SecurityConfig {
    /// Effective form age threshold.
    pub fn max_form_age(&self) -> u64 {
        self.max_form_age_seconds.unwrap_or(self.token_ttl_seconds)
    }

    /// Whether `form_id` is accepted by the allow-list.
    pub fn form_allowed(&self, form_id: &str) -> bool {
        self.forms.is_empty() || self.forms.iter().any(|f| f == form_id)
    }
}

impl ChallengeConfig {
    /// Both keys present.
    pub fn is_configured(&self) -> bool {
        !self.site_key.trim().is_empty() && !self.secret_key.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_seconds)
    }

    pub fn endpoint(&self) -> &str {
        self.verify_url
            .as_deref()
            .unwrap_or_else(|| self.provider.verify_url())
    }
}

impl Config {
    /// Load configuration from an optional JSON file (`EFORMS_CONFIG`)
    /// followed by individual environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Like [`Config::from_env`] with an explicit file taking precedence
    /// over `EFORMS_CONFIG`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => match env_string("EFORMS_CONFIG") {
                Some(path) => Self::from_file(Path::new(&path))?,
                None => Self::default(),
            },
        };
        base.with_env_overrides().map(Self::normalized)
    }

    /// Parse a JSON configuration file. Missing keys take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Some(v) = env_string("EFORMS_BIND_ADDR").or_else(|| env_string("BIND_ADDR")) {
            self.bind_addr = v;
        }
        if let Some(v) = env_string("EFORMS_STORAGE_ROOT") {
            self.storage.root = PathBuf::from(v);
        }
        if let Some(v) = env_parse("EFORMS_TOKEN_TTL_SECONDS")? {
            self.security.token_ttl_seconds = v;
        }
        if let Some(v) = env_parse("EFORMS_MIN_FILL_SECONDS")? {
            self.security.min_fill_seconds = v;
        }
        if let Some(v) = env_parse("EFORMS_MAX_FORM_AGE_SECONDS")? {
            self.security.max_form_age_seconds = Some(v);
        }
        if let Some(v) = env_enum("EFORMS_ORIGIN_MODE")? {
            self.security.origin_mode = v;
        }
        if let Some(v) = env_string("EFORMS_PUBLIC_ORIGIN") {
            self.security.public_origin = Some(v);
        }
        if let Some(v) = env_enum("EFORMS_HONEYPOT_RESPONSE")? {
            self.security.honeypot_response = v;
        }
        if let Some(v) = env_enum("EFORMS_CHALLENGE_MODE")? {
            self.challenge.mode = v;
        }
        if let Some(v) = env_enum("EFORMS_CHALLENGE_PROVIDER")? {
            self.challenge.provider = v;
        }
        if let Some(v) = env_string("EFORMS_CHALLENGE_SITE_KEY") {
            self.challenge.site_key = v;
        }
        if let Some(v) = env_string("EFORMS_CHALLENGE_SECRET_KEY") {
            self.challenge.secret_key = v;
        }
        if let Some(v) = env_parse("EFORMS_THROTTLE_ENABLE")? {
            self.throttle.enable = v;
        }
        if let Some(v) = env_parse("EFORMS_THROTTLE_MAX_PER_MINUTE")? {
            self.throttle.max_per_minute = v;
        }
        if let Some(v) = env_parse("EFORMS_THROTTLE_COOLDOWN_SECONDS")? {
            self.throttle.cooldown_seconds = v;
        }
        if let Some(v) = env_enum("EFORMS_IP_MODE")? {
            self.privacy.ip_mode = v;
        }
        if let Some(v) = env_string("EFORMS_CLIENT_IP_HEADER") {
            self.privacy.client_ip_header = Some(v);
        }
        if let Some(v) = env_string("EFORMS_TRUSTED_PROXIES") {
            self.privacy.trusted_proxies = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = env_string("EFORMS_IP_HASH_SALT") {
            self.privacy.ip_hash_salt = v;
        }
        if let Some(v) = env_parse("EFORMS_UPLOAD_RETENTION_SECONDS")? {
            self.uploads.retention_seconds = v;
        }
        Ok(self)
    }

    /// Clamp numeric settings to their supported ranges.
    pub fn normalized(mut self) -> Self {
        let s = &mut self.security;
        s.token_ttl_seconds = clamp(
            "security.token_ttl_seconds",
            s.token_ttl_seconds,
            TOKEN_TTL_MIN,
            TOKEN_TTL_MAX,
        );
        s.min_fill_seconds = clamp("security.min_fill_seconds", s.min_fill_seconds, 0, MIN_FILL_MAX);
        if let Some(age) = s.max_form_age_seconds {
            s.max_form_age_seconds = Some(clamp(
                "security.max_form_age_seconds",
                age,
                MAX_FORM_AGE_MIN,
                MAX_FORM_AGE_MAX,
            ));
        }

        let c = &mut self.challenge;
        c.http_timeout_seconds = clamp(
            "challenge.http_timeout_seconds",
            c.http_timeout_seconds,
            CHALLENGE_TIMEOUT_MIN,
            CHALLENGE_TIMEOUT_MAX,
        );

        let t = &mut self.throttle;
        t.max_per_minute = clamp(
            "throttle.max_per_minute",
            t.max_per_minute,
            MAX_PER_MINUTE_MIN,
            MAX_PER_MINUTE_MAX,
        );
        t.cooldown_seconds = clamp("throttle.cooldown_seconds", t.cooldown_seconds, 0, COOLDOWN_MAX);
        if !(t.hard_multiplier.is_finite() && t.hard_multiplier >= 1.0) {
            warn!(
                code = "EFORMS_CONFIG_CLAMPED",
                key = "throttle.hard_multiplier",
                value = t.hard_multiplier,
                "Config value out of range"
            );
            t.hard_multiplier = default_hard_multiplier();
        }

        if self.gc.batch_limit == 0 {
            self.gc.batch_limit = default_batch_limit();
        }
        self
    }
}

fn clamp<T>(key: &'static str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    let clamped = if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    };
    if clamped != value {
        warn!(
            code = "EFORMS_CONFIG_CLAMPED",
            key,
            value = %value,
            clamped = %clamped,
            "Config value out of range"
        );
    }
    clamped
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(v) => v
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        None => Ok(None),
    }
}

/// Parse an enum setting through its serde representation.
fn env_enum<T: serde::de::DeserializeOwned>(key: &'static str) -> Result<Option<T>, ConfigError> {
    match env_string(key) {
        Some(v) => serde_json::from_value(serde_json::Value::String(v.to_lowercase()))
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: v }),
        None => Ok(None),
    }
}
