//! Provider integrations behind the `ModelAdapter` capability.
//!
//! Call sites never branch on provider identity: the dispatcher holds an
//! `Arc<dyn ModelAdapter>` built once per job by an `AdapterFactory`, and
//! everything provider-specific (wire format, auth header, pricing) lives
//! in the per-provider modules.

pub mod anthropic;
pub mod gemini;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::{DEFAULT_CONCURRENCY, DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE, MAX_CONCURRENCY};

// ============================================================================
// Provider identity & model configuration
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Gemini,
    Anthropic,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "gemini",
            ProviderKind::Anthropic => "anthropic",
        }
    }

    /// Environment variable consulted when the job config carries no key.
    pub fn env_key(&self) -> &'static str {
        match self {
            ProviderKind::Gemini => "GEMINI_API_KEY",
            ProviderKind::Anthropic => "ANTHROPIC_API_KEY",
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub provider: ProviderKind,
    pub model_name: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Cross-image concurrency for this job; clamped to 1..=MAX_CONCURRENCY.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Never serialized: persisted job rows and API responses must not echo
    /// credentials. Resolved once at adapter build time.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f64 {
    DEFAULT_TEMPERATURE
}

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_concurrency() -> usize {
    DEFAULT_CONCURRENCY
}

impl ModelConfig {
    /// Requested concurrency clamped to a sane bound. Out-of-range values
    /// are accepted with a warning rather than rejected.
    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            warn!("concurrency 0 requested; clamping to 1");
            1
        } else if self.concurrency > MAX_CONCURRENCY {
            warn!(
                requested = self.concurrency,
                max = MAX_CONCURRENCY,
                "concurrency above ceiling; clamping"
            );
            MAX_CONCURRENCY
        } else {
            self.concurrency
        }
    }

    /// Job-supplied key wins; falls back to the provider's env variable.
    pub fn resolve_api_key(&self) -> Result<String, AdapterError> {
        if let Some(key) = self.api_key.as_deref() {
            if !key.is_empty() {
                return Ok(key.to_string());
            }
        }
        match std::env::var(self.provider.env_key()) {
            Ok(key) if !key.is_empty() => Ok(key),
            _ => Err(AdapterError::Auth(format!(
                "no API key for {}: pass model_config.api_key or set {}",
                self.provider,
                self.provider.env_key()
            ))),
        }
    }
}

// ============================================================================
// Adapter capability
// ============================================================================

#[derive(Debug, Clone)]
pub struct AdapterResponse {
    pub text: String,
    pub latency_ms: u64,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    /// USD, computed from the provider's published per-token rates.
    pub cost: Option<f64>,
}

impl AdapterResponse {
    pub fn tokens_used(&self) -> Option<u64> {
        match (self.input_tokens, self.output_tokens) {
            (None, None) => None,
            (i, o) => Some(i.unwrap_or(0) + o.unwrap_or(0)),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("transient provider error: {0}")]
    Transient(String),

    #[error("provider error: {0}")]
    Unknown(String),
}

impl AdapterError {
    /// Only rate limits and transient faults are worth another attempt;
    /// auth and malformed requests will fail identically every time.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterError::RateLimited(_) | AdapterError::Transient(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AdapterError::Auth(_) => "auth",
            AdapterError::RateLimited(_) => "rate_limited",
            AdapterError::InvalidRequest(_) => "invalid_request",
            AdapterError::Transient(_) => "transient",
            AdapterError::Unknown(_) => "unknown",
        }
    }

    /// Maps a non-2xx provider response onto the taxonomy.
    pub(crate) fn from_status(status: reqwest::StatusCode, body: &str) -> AdapterError {
        let message = format!("HTTP {}: {}", status.as_u16(), truncate_body(body));
        match status.as_u16() {
            401 | 403 => AdapterError::Auth(message),
            429 => AdapterError::RateLimited(message),
            400 | 404 | 413 | 422 => AdapterError::InvalidRequest(message),
            408 => AdapterError::Transient(message),
            s if (500..600).contains(&s) => AdapterError::Transient(message),
            _ => AdapterError::Unknown(message),
        }
    }

    /// Network-level failures: timeouts and connect errors are retryable.
    pub(crate) fn from_request_error(e: reqwest::Error) -> AdapterError {
        if e.is_timeout() || e.is_connect() {
            AdapterError::Transient(e.to_string())
        } else {
            AdapterError::Unknown(e.to_string())
        }
    }
}

fn truncate_body(body: &str) -> String {
    const MAX: usize = 300;
    if body.len() <= MAX {
        return body.to_string();
    }
    let cut = body
        .char_indices()
        .take_while(|(i, _)| *i < MAX)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}...", &body[..cut])
}

/// One vision call: system message + rendered prompt + image in, raw text
/// plus usage out. Implementations must be safe to call concurrently.
#[async_trait]
pub trait ModelAdapter: Send + Sync {
    async fn invoke(
        &self,
        system_message: Option<&str>,
        prompt: &str,
        image: &Bytes,
    ) -> Result<AdapterResponse, AdapterError>;
}

/// Builds the adapter for a job's model config. A trait so tests can hand
/// the engine scripted adapters without any HTTP.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn ModelAdapter>, AdapterError>;
}

pub struct HttpAdapterFactory {
    client: reqwest::Client,
}

impl HttpAdapterFactory {
    pub fn new(client: reqwest::Client) -> Self {
        HttpAdapterFactory { client }
    }
}

impl AdapterFactory for HttpAdapterFactory {
    fn build(&self, config: &ModelConfig) -> Result<Arc<dyn ModelAdapter>, AdapterError> {
        match config.provider {
            ProviderKind::Gemini => Ok(Arc::new(gemini::GeminiAdapter::new(
                self.client.clone(),
                config.clone(),
            )?)),
            ProviderKind::Anthropic => Ok(Arc::new(anthropic::AnthropicAdapter::new(
                self.client.clone(),
                config.clone(),
            )?)),
        }
    }
}

// ============================================================================
// Pricing
// ============================================================================

/// USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelRates {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelRates {
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Published rates by model-name prefix; unrecognized models fall back to
/// the provider's mid-tier pricing so estimates stay order-of-magnitude
/// correct rather than zero.
pub fn model_rates(provider: ProviderKind, model_name: &str) -> ModelRates {
    let (input, output) = match provider {
        ProviderKind::Gemini => match model_name {
            m if m.starts_with("gemini-1.5-flash") => (0.075, 0.30),
            m if m.starts_with("gemini-1.5-pro") => (1.25, 5.00),
            m if m.starts_with("gemini-2.0-flash") => (0.10, 0.40),
            m if m.starts_with("gemini-2.5-pro") => (1.25, 10.00),
            _ => (0.10, 0.40),
        },
        ProviderKind::Anthropic => match model_name {
            m if m.contains("haiku") => (0.80, 4.00),
            m if m.contains("opus") => (15.00, 75.00),
            m if m.contains("sonnet") => (3.00, 15.00),
            _ => (3.00, 15.00),
        },
    };
    ModelRates {
        input_per_million: input,
        output_per_million: output,
    }
}

// ============================================================================
// Image payload helpers
// ============================================================================

/// Sniffs the MIME type from magic bytes. Providers reject mismatched
/// types, so this beats trusting file extensions the manifest may not have.
pub fn image_mime_type(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        "image/png"
    } else if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "image/jpeg"
    } else if bytes.len() >= 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        "image/webp"
    } else if bytes.starts_with(b"GIF8") {
        "image/gif"
    } else {
        "image/png"
    }
}

// ============================================================================
// Tests
// ============================================================================
