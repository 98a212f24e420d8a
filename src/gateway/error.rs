//! Failures a [`ModelCaller`](super::ModelCaller) may report.
//!
//! The pipeline turns every one of these into a per-item
//! [`QueryResult::Error`](crate::response::QueryResult::Error); none of them
//! aborts a run.

use std::time::Duration;

use thiserror::Error;

/// Provider-side details kept for debugging failed calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code, e.g. `"context_length_exceeded"`.
    pub provider_code: Option<String>,
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} rate limited the call{}", retry_hint(.retry_after))]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
        context: ErrorContext,
    },

    #[error("{provider} rejected the request: {message}")]
    InvalidRequest {
        provider: String,
        message: String,
        context: ErrorContext,
    },

    /// Content policy or safety refusal.
    #[error("{provider} refused to answer: {message}")]
    Refused {
        provider: String,
        message: String,
        context: ErrorContext,
    },

    #[error("{provider} error: {message}")]
    Provider {
        provider: String,
        message: String,
        retryable: bool,
        context: ErrorContext,
    },

    #[error("{provider} call timed out after {elapsed:?}")]
    Timeout {
        provider: String,
        elapsed: Duration,
        context: ErrorContext,
    },

    /// Missing credentials, unknown model and the like. Not tied to a call.
    #[error("model call misconfigured: {0}")]
    Config(String),
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {d:?})"),
        None => String::new(),
    }
}

impl ProviderError {
    pub fn rate_limited(provider: impl Into<String>, retry_after: Option<Duration>) -> Self {
        Self::RateLimited {
            provider: provider.into(),
            retry_after,
            context: ErrorContext::default(),
        }
    }

    pub fn invalid_request(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            provider: provider.into(),
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn refused(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Refused {
            provider: provider.into(),
            message: message.into(),
            context: ErrorContext::default(),
        }
    }

    pub fn provider(provider: impl Into<String>, message: impl Into<String>, retryable: bool) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
            retryable,
            context: ErrorContext::default(),
        }
    }

    pub fn timeout(provider: impl Into<String>, elapsed: Duration) -> Self {
        Self::Timeout {
            provider: provider.into(),
            elapsed,
            context: ErrorContext::default(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Attach provider details. No effect on [`ProviderError::Config`].
    pub fn with_context(mut self, ctx: ErrorContext) -> Self {
        if let Some(slot) = self.context_mut() {
            *slot = ctx;
        }
        self
    }

    /// Whether retrying the same call could succeed. Nothing in this crate
    /// retries; hosts wrapping a caller may.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout { .. } => true,
            Self::Provider { retryable, .. } => *retryable,
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Config(_) => false,
        }
    }

    /// Short code recorded on usage records.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Provider { .. } => "provider_error",
            Self::Timeout { .. } => "timeout",
            Self::Config(_) => "config_error",
        }
    }

    pub fn provider_name(&self) -> Option<&str> {
        match self {
            Self::RateLimited { provider, .. }
            | Self::InvalidRequest { provider, .. }
            | Self::Refused { provider, .. }
            | Self::Provider { provider, .. }
            | Self::Timeout { provider, .. } => Some(provider),
            Self::Config(_) => None,
        }
    }

    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout { context, .. } => Some(context),
            Self::Config(_) => None,
        }
    }

    fn context_mut(&mut self) -> Option<&mut ErrorContext> {
        match self {
            Self::RateLimited { context, .. }
            | Self::InvalidRequest { context, .. }
            | Self::Refused { context, .. }
            | Self::Provider { context, .. }
            | Self::Timeout { context, .. } => Some(context),
            Self::Config(_) => None,
        }
    }

    pub fn request_id(&self) -> Option<&str> {
        self.context().and_then(|c| c.request_id.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_retryability() {
        let err = ProviderError::provider("openai", "overloaded", true);
        assert_eq!(err.code(), "provider_error");
        assert!(err.is_retryable());
        assert_eq!(err.to_string(), "openai error: overloaded");

        let err = ProviderError::refused("anthropic", "content policy");
        assert_eq!(err.code(), "refused");
        assert!(!err.is_retryable());
        assert_eq!(err.provider_name(), Some("anthropic"));

        assert_eq!(ProviderError::config("no key").provider_name(), None);
    }

    #[test]
    fn messages_mention_retry_hints_only_when_known() {
        let with = ProviderError::rate_limited("google", Some(Duration::from_secs(2)));
        assert_eq!(with.to_string(), "google rate limited the call (retry after 2s)");
        let without = ProviderError::rate_limited("google", None);
        assert_eq!(without.to_string(), "google rate limited the call");
    }

    #[test]
    fn request_id_comes_from_attached_context() {
        let err = ProviderError::timeout("ollama", Duration::from_secs(30))
            .with_context(ErrorContext::new().with_status(504).with_request_id("req-1"));
        assert_eq!(err.request_id(), Some("req-1"));
        assert_eq!(err.context().and_then(|c| c.http_status), Some(504));

        let cfg = ProviderError::config("missing key").with_context(ErrorContext::new().with_request_id("x"));
        assert_eq!(cfg.request_id(), None);
    }
}
