//! Error types for the Mureka client.

use thiserror::Error;

/// Result type for Mureka client operations.
pub type Result<T> = std::result::Result<T, MurekaError>;

/// Mureka client errors.
#[derive(Debug, Error)]
pub enum MurekaError {
    /// Configuration error (missing API key, missing endpoint)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network error (connection failed, timeout)
    #[error("Network error: {0}")]
    Network(String),

    /// API error (non-2xx response, rate limit, invalid request)
    #[error("API error ({status}): {body}")]
    Api {
        status: u16,
        body: String,
        /// Parsed `Retry-After` header, if the provider sent one.
        retry_after: Option<u64>,
    },

    /// Parse error (invalid JSON, missing job id, unexpected shape)
    #[error("Parse error: {0}")]
    Parse(String),
}

impl MurekaError {
    /// The HTTP status code, for API errors.
    pub fn status(&self) -> Option<u16> {
        match self {
            MurekaError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this is an HTTP 429 response.
    pub fn is_too_many_requests(&self) -> bool {
        self.status() == Some(429)
    }

    /// Whether this is a transient upstream error (502/503/504).
    pub fn is_transient_infra(&self) -> bool {
        matches!(self.status(), Some(502) | Some(503) | Some(504))
    }
}

/// Classification of an HTTP 429 response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitKind {
    /// The account has no remaining allowance; retrying wastes time.
    Quota,
    /// Requests came in too fast; retry with backoff.
    RateLimit,
}

const QUOTA_MARKERS: &[&str] = &["quota", "exceeded", "credits", "billing"];
const RATE_LIMIT_MARKERS: &[&str] = &["rate limit", "too quickly", "pace your requests"];

/// Classify the error message of an HTTP 429 response.
///
/// Quota markers are checked first: a quota failure must never be
/// retried. Unknown messages default to `RateLimit`, the safer
/// assumption — a mislabeled quota failure only burns retry budget,
/// while a mislabeled rate limit loses a recoverable job.
pub fn classify_rate_limit(message: &str) -> RateLimitKind {
    let lower = message.to_lowercase();

    if QUOTA_MARKERS.iter().any(|m| lower.contains(m)) {
        return RateLimitKind::Quota;
    }

    if RATE_LIMIT_MARKERS.iter().any(|m| lower.contains(m)) {
        return RateLimitKind::RateLimit;
    }

    RateLimitKind::RateLimit
}
