/// Resilience wrapper around outbound AI calls.
///
/// Every embedding and generation request goes through
/// [`AiMiddleware::execute`]: inputs are validated, the provider key is
/// checked against its sliding-window rate limit, the operation runs under a
/// timeout, and failures are classified. Transient failures (network,
/// timeout) are retried with exponential backoff.
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::ProviderError;
use super::rate_limit::RateLimiter;
use crate::config::MiddlewareConfig;

/// Inputs describing one generation call, checked before anything is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiOperationContext {
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AiErrorKind {
    NetworkError,
    Timeout,
    AuthenticationError,
    ValidationError,
    ConfigurationError,
    ModelNotAvailable,
    InsufficientQuota,
    RateLimitExceeded,
    UnknownError,
}

impl AiErrorKind {
    /// Only transient transport failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::NetworkError | Self::Timeout)
    }

    pub fn classify(err: &ProviderError) -> Self {
        match err {
            ProviderError::Network(_) => Self::NetworkError,
            ProviderError::Timeout(_) => Self::Timeout,
            ProviderError::Unauthorized(_) => Self::AuthenticationError,
            ProviderError::InvalidRequest(_) => Self::ValidationError,
            ProviderError::ModelNotAvailable(_) => Self::ModelNotAvailable,
            ProviderError::QuotaExceeded(_) => Self::InsufficientQuota,
            ProviderError::Configuration(_) => Self::ConfigurationError,
            ProviderError::Other(_) => Self::UnknownError,
        }
    }
}

impl fmt::Display for AiErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NetworkError => "NetworkError",
            Self::Timeout => "Timeout",
            Self::AuthenticationError => "AuthenticationError",
            Self::ValidationError => "ValidationError",
            Self::ConfigurationError => "ConfigurationError",
            Self::ModelNotAvailable => "ModelNotAvailable",
            Self::InsufficientQuota => "InsufficientQuota",
            Self::RateLimitExceeded => "RateLimitExceeded",
            Self::UnknownError => "UnknownError",
        };
        f.write_str(s)
    }
}

/// A classified AI failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct AiError {
    pub kind: AiErrorKind,
    pub message: String,
}

impl AiError {
    pub fn new(kind: AiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

impl From<ProviderError> for AiError {
    fn from(err: ProviderError) -> Self {
        Self::new(AiErrorKind::classify(&err), err.to_string())
    }
}

/// Outcome of [`AiMiddleware::execute`] with timing and retry bookkeeping.
#[derive(Debug)]
pub struct AiOperationResult<T> {
    pub outcome: Result<T, AiError>,
    pub operation_name: String,
    pub provider_name: String,
    pub duration: Duration,
    pub retry_count: u32,
}

impl<T> AiOperationResult<T> {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn error(&self) -> Option<&AiError> {
        self.outcome.as_ref().err()
    }

    pub fn into_result(self) -> Result<T, AiError> {
        self.outcome
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MiddlewareStats {
    pub total_operations: u64,
    pub failed_operations: u64,
    pub total_retries: u64,
    pub operations_with_retries: u64,
    pub active_rate_limit_keys: usize,
}

pub struct AiMiddleware {
    config: MiddlewareConfig,
    limiter: RateLimiter,
    total_operations: AtomicU64,
    failed_operations: AtomicU64,
    total_retries: AtomicU64,
    operations_with_retries: AtomicU64,
}

impl AiMiddleware {
    pub fn new(config: MiddlewareConfig) -> Self {
        let limiter = RateLimiter::new(config.rate_limit, config.provider_limits.clone());
        Self {
            config,
            limiter,
            total_operations: AtomicU64::new(0),
            failed_operations: AtomicU64::new(0),
            total_retries: AtomicU64::new(0),
            operations_with_retries: AtomicU64::new(0),
        }
    }

    /// Run `operation` with validation, rate limiting and retry.
    pub async fn execute<T, F, Fut>(
        &self,
        operation_name: &str,
        provider_key: &str,
        context: Option<&AiOperationContext>,
        operation: F,
    ) -> AiOperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        self.execute_with_cancel(
            operation_name,
            provider_key,
            context,
            &CancellationToken::new(),
            operation,
        )
        .await
    }

    /// Same as [`execute`](Self::execute), aborting early once `cancel` fires.
    /// A cancelled call is reported as a non-retried `Timeout`.
    pub async fn execute_with_cancel<T, F, Fut>(
        &self,
        operation_name: &str,
        provider_key: &str,
        context: Option<&AiOperationContext>,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> AiOperationResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let finish = |outcome: Result<T, AiError>, retry_count: u32| AiOperationResult {
            outcome,
            operation_name: operation_name.to_string(),
            provider_name: provider_key.to_string(),
            duration: started.elapsed(),
            retry_count,
        };

        // Rejected calls count as operations too, so failed <= total
        self.total_operations.fetch_add(1, Ordering::Relaxed);

        if let Err(e) = self.validate(operation_name, context) {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
            return finish(Err(e), 0);
        }

        if !self.limiter.try_acquire(provider_key) {
            let settings = self.limiter.settings_for(provider_key);
            warn!(
                operation = operation_name,
                provider = provider_key,
                "Rate limit exceeded"
            );
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
            return finish(
                Err(AiError::new(
                    AiErrorKind::RateLimitExceeded,
                    format!(
                        "more than {} requests to '{provider_key}' within {}s",
                        settings.max_requests, settings.window_secs
                    ),
                )),
                0,
            );
        }

        let timeout = Duration::from_millis(
            context
                .map(|c| c.timeout_ms)
                .unwrap_or(self.config.default_timeout_ms),
        );

        let mut attempt: u32 = 0;
        let outcome = loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    Err(AiError::new(AiErrorKind::Timeout, "operation cancelled"))
                }
                r = tokio::time::timeout(timeout, operation()) => match r {
                    Ok(inner) => inner.map_err(AiError::from),
                    Err(_) => Err(AiError::new(
                        AiErrorKind::Timeout,
                        format!("no response within {}ms", timeout.as_millis()),
                    )),
                },
            };

            let err = match result {
                Ok(value) => break Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= self.config.max_retries || cancel.is_cancelled() {
                break Err(err);
            }

            let delay = self.backoff_delay(attempt);
            attempt += 1;
            self.total_retries.fetch_add(1, Ordering::Relaxed);
            debug!(
                operation = operation_name,
                provider = provider_key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying AI operation"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    break Err(AiError::new(AiErrorKind::Timeout, "operation cancelled"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        };

        if attempt > 0 {
            self.operations_with_retries.fetch_add(1, Ordering::Relaxed);
        }
        if let Err(e) = &outcome {
            self.failed_operations.fetch_add(1, Ordering::Relaxed);
            warn!(
                operation = operation_name,
                provider = provider_key,
                retries = attempt,
                error = %e,
                "AI operation failed"
            );
        }

        finish(outcome, attempt)
    }

    /// Longest prompt `execute` accepts, in characters.
    pub fn max_prompt_length(&self) -> usize {
        self.config.max_prompt_length
    }

    /// `min(base * 2^attempt, max)`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = Duration::from_millis(self.config.base_delay_ms);
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        base.saturating_mul(factor)
            .min(Duration::from_millis(self.config.max_delay_ms))
    }

    fn validate(
        &self,
        operation_name: &str,
        context: Option<&AiOperationContext>,
    ) -> Result<(), AiError> {
        if operation_name.trim().is_empty() {
            return Err(AiError::new(
                AiErrorKind::ConfigurationError,
                "operation name must not be empty",
            ));
        }
        let Some(ctx) = context else {
            return Ok(());
        };
        if ctx.max_tokens == 0 {
            return Err(AiError::new(
                AiErrorKind::ValidationError,
                "max_tokens must be positive",
            ));
        }
        if ctx.timeout_ms == 0 {
            return Err(AiError::new(
                AiErrorKind::ValidationError,
                "timeout_ms must be positive",
            ));
        }
        let len = ctx.prompt.chars().count();
        if len > self.config.max_prompt_length {
            return Err(AiError::new(
                AiErrorKind::ValidationError,
                format!(
                    "prompt is {len} characters, limit is {}",
                    self.config.max_prompt_length
                ),
            ));
        }
        Ok(())
    }

    pub fn statistics(&self) -> MiddlewareStats {
        MiddlewareStats {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            failed_operations: self.failed_operations.load(Ordering::Relaxed),
            total_retries: self.total_retries.load(Ordering::Relaxed),
            operations_with_retries: self.operations_with_retries.load(Ordering::Relaxed),
            active_rate_limit_keys: self.limiter.active_keys(),
        }
    }

    /// Zero the counters and forget all rate-limit windows.
    pub fn reset_statistics(&self) {
        self.total_operations.store(0, Ordering::Relaxed);
        self.failed_operations.store(0, Ordering::Relaxed);
        self.total_retries.store(0, Ordering::Relaxed);
        self.operations_with_retries.store(0, Ordering::Relaxed);
        self.limiter.reset();
    }
}
