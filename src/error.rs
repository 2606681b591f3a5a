//! Error types for the aggregator

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the aggregator and risk pipeline
#[derive(Error, Debug, Clone)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    // Source errors (transient)
    #[error("Source {source_name} transient failure: {reason}")]
    SourceTransient { source_name: String, reason: String },

    #[error("Source {0} timed out after {1}ms")]
    SourceTimeout(String, u64),

    #[error("Source {0} rate limited")]
    RateLimited(String),

    #[error("Source {source_name} returned malformed payload: {reason}")]
    MalformedPayload { source_name: String, reason: String },

    // Source errors (permanent)
    #[error("Source {source_name} permanent failure: {reason}")]
    SourcePermanent { source_name: String, reason: String },

    // Throttler errors
    #[error("Throttle misconfigured: {0}")]
    ThrottleMisconfigured(String),

    // Run lifecycle errors
    #[error("Aggregation run already in progress")]
    RunInProgress,

    #[error("Run cancelled")]
    Cancelled,

    #[error("No sources available: {}", .0.join("; "))]
    NoSourcesAvailable(Vec<String>),

    // Risk vetting errors
    #[error("Risk check {check} unavailable: {reason}")]
    RiskCheckUnavailable { check: String, reason: String },

    #[error("Invalid token address {address} on {chain}")]
    InvalidToken { address: String, chain: String },

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SourceTransient { .. }
                | Error::SourceTimeout(..)
                | Error::RateLimited(_)
                | Error::MalformedPayload { .. }
        )
    }

    /// Check if this error signals an explicit rate-limit response
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, Error::RateLimited(_))
    }

    /// Classify a non-success HTTP status from a named source
    pub fn from_status(source: &str, status: reqwest::StatusCode, body: &str) -> Self {
        let reason = format!("HTTP {}: {}", status, truncate(body, 200));
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            Error::RateLimited(source.to_string())
        } else if status.is_server_error() || status == reqwest::StatusCode::REQUEST_TIMEOUT {
            Error::SourceTransient {
                source_name: source.to_string(),
                reason,
            }
        } else {
            Error::SourcePermanent {
                source_name: source.to_string(),
                reason,
            }
        }
    }

    /// Classify a reqwest transport error from a named source
    pub fn from_reqwest(source: &str, e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::SourceTimeout(source.to_string(), 0)
        } else if e.is_decode() {
            Error::MalformedPayload {
                source_name: source.to_string(),
                reason: e.to_string(),
            }
        } else if e.is_builder() {
            Error::SourcePermanent {
                source_name: source.to_string(),
                reason: e.to_string(),
            }
        } else {
            Error::SourceTransient {
                source_name: source.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert!(Error::from_status("llama", StatusCode::TOO_MANY_REQUESTS, "").is_rate_limit());
        assert!(Error::from_status("llama", StatusCode::BAD_GATEWAY, "").is_retryable());
        assert!(Error::from_status("llama", StatusCode::REQUEST_TIMEOUT, "").is_retryable());

        let not_found = Error::from_status("llama", StatusCode::NOT_FOUND, "missing");
        assert!(!not_found.is_retryable());
        assert!(matches!(not_found, Error::SourcePermanent { .. }));

        let unauthorized = Error::from_status("llama", StatusCode::UNAUTHORIZED, "");
        assert!(!unauthorized.is_retryable());
    }

    #[test]
    fn test_rate_limit_is_retryable() {
        let e = Error::RateLimited("dexscreener".to_string());
        assert!(e.is_retryable());
        assert!(e.is_rate_limit());
    }

    #[test]
    fn test_no_sources_message() {
        let e = Error::NoSourcesAvailable(vec!["a: down".into(), "b: 500".into()]);
        assert_eq!(e.to_string(), "No sources available: a: down; b: 500");
    }

    #[test]
    fn test_truncate_is_char_safe() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("ok", 10), "ok");
    }

    #[test]
    fn test_unavailable_check_is_not_retried() {
        let e = Error::RiskCheckUnavailable {
            check: "holders".into(),
            reason: "Missing environment variable: MORALIS_API_KEY".into(),
        };
        assert!(!e.is_retryable());
        assert_eq!(
            e.to_string(),
            "Risk check holders unavailable: Missing environment variable: MORALIS_API_KEY"
        );
    }
}
