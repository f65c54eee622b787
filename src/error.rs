//! Error types for sotto

use std::time::Duration;

use thiserror::Error;

/// Result type alias using sotto's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// All possible errors in a dictation attempt
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio capture error: {0}")]
    Capture(String),

    #[error("Transcription failed: {0}")]
    Transcription(String),

    #[error("Cleanup failed: {0}")]
    Cleanup(String),

    #[error("Injection failed: {0}")]
    Injection(String),

    #[error("Injection already in flight")]
    InjectionBusy,

    #[error("Permission not granted: {0}")]
    Permission(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Backend error ({status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Rate limited")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Provider not configured: {0}")]
    ProviderNotConfigured(String),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a cleanup attempt hitting this error is worth retrying.
    ///
    /// Network failures, rate limits, and server-side errors are transient;
    /// everything else (bad credentials, malformed requests) is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::RateLimited { .. } => true,
            Error::Backend { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The server-suggested delay before retrying, if one was provided.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_are_retryable() {
        assert!(Error::Backend { status: 500, message: "boom".into() }.is_retryable());
        assert!(Error::Backend { status: 503, message: "busy".into() }.is_retryable());
        assert!(Error::RateLimited { retry_after: None }.is_retryable());
    }

    #[test]
    fn test_client_errors_are_not_retryable() {
        assert!(!Error::Backend { status: 401, message: "bad key".into() }.is_retryable());
        assert!(!Error::ProviderNotConfigured("cloud".into()).is_retryable());
        assert!(!Error::Cleanup("empty rewrite".into()).is_retryable());
    }

    #[test]
    fn test_retry_after_only_set_for_rate_limits() {
        let hint = Duration::from_secs(2);
        let err = Error::RateLimited { retry_after: Some(hint) };
        assert_eq!(err.retry_after(), Some(hint));
        assert_eq!(Error::Backend { status: 500, message: String::new() }.retry_after(), None);
    }
}
