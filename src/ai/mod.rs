//! AI backend abstraction.
//!
//! - **[`AiProvider`]** — text generation collaborator (Ollama in production)
//! - **[`ProviderHandle`]** — hot-swappable reference to the active provider
//! - **[`middleware`]** — validation, rate limiting, retry and error
//!   classification wrapped around every outbound AI call
pub mod middleware;
pub mod ollama;
pub mod rate_limit;

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use thiserror::Error;

/// Failures surfaced by AI providers and embedders.
///
/// Variants follow the failure categories the middleware classifies, so an
/// adapter only has to decide which bucket a backend failure belongs in.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("authentication failed: {0}")]
    Unauthorized(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("model not available: {0}")]
    ModelNotAvailable(String),

    #[error("quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("provider misconfigured: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return Self::Timeout(e.to_string());
        }
        if e.is_connect() || e.is_request() {
            return Self::Network(e.to_string());
        }
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16(), &e.to_string());
        }
        if e.is_builder() {
            return Self::Configuration(e.to_string());
        }
        if e.is_decode() || e.is_body() {
            return Self::Network(e.to_string());
        }
        Self::Other(e.to_string())
    }
}

impl ProviderError {
    /// Map an HTTP status returned by a provider.
    pub fn from_status(status: u16, message: &str) -> Self {
        let msg = message.to_string();
        match status {
            401 | 403 => Self::Unauthorized(msg),
            404 => Self::ModelNotAvailable(msg),
            402 | 429 => Self::QuotaExceeded(msg),
            400 | 413 | 422 => Self::InvalidRequest(msg),
            408 | 504 => Self::Timeout(msg),
            500..=599 => Self::Network(msg),
            _ => Self::Other(msg),
        }
    }
}

/// A text generation backend.
#[async_trait]
pub trait AiProvider: Send + Sync {
    /// Whether the backend answers at all.
    async fn is_available(&self) -> bool;

    /// Generate a completion for `prompt`, optionally grounded in `context`.
    async fn generate(
        &self,
        prompt: &str,
        context: Option<&str>,
        temperature: f32,
    ) -> Result<String, ProviderError>;

    /// Backend family, e.g. `ollama`. Used as the rate-limit key.
    fn provider_type(&self) -> &str;

    fn provider_name(&self) -> &str;

    fn current_model(&self) -> &str;

    fn base_url(&self) -> &str;
}

/// Shared, replaceable reference to the active provider.
///
/// Callers take a snapshot with [`current`](Self::current) and keep it for the
/// whole call, so a concurrent [`swap`](Self::swap) never pulls a provider out
/// from under an in-flight request. The old provider is dropped when the last
/// snapshot goes away.
#[derive(Clone)]
pub struct ProviderHandle {
    inner: Arc<RwLock<Arc<dyn AiProvider>>>,
}

impl ProviderHandle {
    pub fn new(provider: Arc<dyn AiProvider>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(provider)),
        }
    }

    pub fn current(&self) -> Arc<dyn AiProvider> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Install a new provider and hand back the previous one.
    pub fn swap(&self, provider: Arc<dyn AiProvider>) -> Arc<dyn AiProvider> {
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        tracing::info!(
            from = guard.provider_name(),
            to = provider.provider_name(),
            "Switching AI provider"
        );
        std::mem::replace(&mut *guard, provider)
    }
}
