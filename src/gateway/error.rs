//! Failure modes of the chat and embeddings gateway.

use std::time::Duration;
use thiserror::Error;

/// What the provider reported alongside a non-2xx reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub http_status: Option<u16>,
    /// Provider error code, e.g. "rate_limit_exceeded". Numeric codes are kept as text.
    pub provider_code: Option<String>,
    /// `x-request-id` response header.
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn from_status(status: u16, request_id: Option<String>) -> Self {
        Self {
            http_status: Some(status),
            provider_code: None,
            request_id,
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// HTTP 429. `retry_after` is the server's `Retry-After` hint, when sent.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        retry_after: Option<Duration>,
        context: ErrorContext,
    },

    /// Rejected by local input checks or by the provider with 400/422.
    #[error("invalid request: {message}")]
    InvalidRequest {
        message: String,
        context: Option<ErrorContext>,
    },

    /// The model declined to answer.
    #[error("refused: {message}")]
    Refused { message: String },

    /// Any other provider-side failure. Retryable for 5xx statuses.
    #[error("provider error: {message}")]
    Upstream {
        message: String,
        context: ErrorContext,
    },

    /// A successful reply whose body does not have the expected shape.
    #[error("unexpected {endpoint} response: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },

    /// Transport failure; timeouts and refused connections are retryable.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Missing or unusable credentials or client settings.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
            context: None,
        }
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::Refused {
            message: message.into(),
        }
    }

    pub fn decode(endpoint: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            endpoint,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited { .. } => true,
            Self::Upstream { context, .. } => context.http_status.is_some_and(|s| s >= 500),
            Self::Http(e) => e.is_timeout() || e.is_connect(),
            Self::InvalidRequest { .. } | Self::Refused { .. } | Self::Decode { .. } => false,
            Self::Config(_) => false,
        }
    }

    /// Server-provided wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Short code for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::Refused { .. } => "refused",
            Self::Upstream { .. } => "upstream",
            Self::Decode { .. } => "decode",
            Self::Http(_) => "http",
            Self::Config(_) => "config",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_server_side_failures_are_retryable() {
        let upstream = |status| ProviderError::Upstream {
            message: "x".into(),
            context: ErrorContext::from_status(status, None),
        };
        assert!(upstream(503).is_retryable());
        assert!(!upstream(404).is_retryable());
        assert!(!ProviderError::decode("embeddings", "no data").is_retryable());
        assert!(!ProviderError::refused("no").is_retryable());

        let limited = ProviderError::RateLimited {
            retry_after: Some(Duration::from_secs(3)),
            context: ErrorContext::from_status(429, Some("req-1".into())),
        };
        assert!(limited.is_retryable());
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(3)));
        assert_eq!(upstream(500).retry_after(), None);
    }
}
