use std::time::Duration;
use thiserror::Error;

/// Error taxonomy for the resilience layer
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (permanent failures)
    #[error("Configuration error: {0}")]
    Config(#[from] ::config::ConfigError),

    #[error("Invalid input: {field} - {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors (usually permanent)
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    // Network errors (transient - should retry)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Timeout error: operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    // Client errors (permanent - don't retry)
    #[error("HTTP {status} from {url}")]
    ClientStatus { status: u16, url: String },

    // Server and other non-success statuses (transient - should retry)
    #[error("HTTP {status} from {url}")]
    UpstreamStatus { status: u16, url: String },

    #[error("All {attempts} attempts failed: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    #[error("Operation cancelled")]
    Cancelled,
}

/// Error categorization for retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Permanent errors - should not retry
    Permanent,
    /// Transient errors - safe to retry
    Transient,
    /// The caller gave up waiting
    Cancelled,
}

impl Error {
    /// Categorize error for retry logic
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self {
            Self::Config(_)
            | Self::InvalidInput { .. }
            | Self::Url(_)
            | Self::Serde(_)
            | Self::ClientStatus { .. } => ErrorCategory::Permanent,

            Self::Http(_)
            | Self::Io(_)
            | Self::Timeout { .. }
            | Self::UpstreamStatus { .. }
            | Self::RetriesExhausted { .. } => ErrorCategory::Transient,

            Self::Cancelled => ErrorCategory::Cancelled,
        }
    }

    /// Check if error is retryable
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    /// HTTP status behind this error, looking through exhausted retries
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ClientStatus { status, .. } | Self::UpstreamStatus { status, .. } => {
                Some(*status)
            }
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            Self::RetriesExhausted { source, .. } => source.status(),
            _ => None,
        }
    }

    /// Whether the final failure was a deadline expiry
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Http(e) => e.is_timeout(),
            Self::RetriesExhausted { source, .. } => source.is_timeout(),
            _ => false,
        }
    }

    /// Classify a non-success HTTP status
    #[must_use]
    pub fn from_status(status: u16, url: impl Into<String>) -> Self {
        let url = url.into();
        if (400..500).contains(&status) {
            Self::ClientStatus { status, url }
        } else {
            Self::UpstreamStatus { status, url }
        }
    }

    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
