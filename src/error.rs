//! Error types for Tern

use thiserror::Error;

/// Result type alias for Tern operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating a conversation
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Transient backend error{}: {message}", fmt_status(.status))]
    TransientBackend {
        status: Option<u16>,
        message: String,
    },

    #[error("Quota exceeded: {message}")]
    Quota { message: String },

    #[error("Backend error (HTTP {status}): {message}")]
    Backend { status: u16, message: String },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String, raw: String },

    #[error("Compression failed: {0}")]
    CompressionFailed(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

fn fmt_status(status: &Option<u16>) -> String {
    status.map(|s| format!(" (HTTP {s})")).unwrap_or_default()
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl Error {
    /// Build a malformed-response error that keeps the offending payload.
    pub fn malformed(message: impl Into<String>, raw: impl Into<String>) -> Self {
        Error::MalformedResponse {
            message: message.into(),
            raw: raw.into(),
        }
    }

    /// Classify a non-2xx HTTP reply.
    pub fn from_http_status(status: u16, body: impl Into<String>) -> Self {
        let message = body.into();
        match status {
            429 if is_quota_message(&message) => Error::Quota { message },
            408 | 429 | 500..=599 => Error::TransientBackend {
                status: Some(status),
                message,
            },
            _ => Error::Backend { status, message },
        }
    }

    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::TransientBackend { .. } => true,
            Error::Http(e) => e.is_timeout() || e.is_connect(),
            _ => false,
        }
    }

    /// Whether the failure should trigger a model downgrade.
    pub fn is_quota(&self) -> bool {
        matches!(self, Error::Quota { .. })
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("quota") || lower.contains("resource_exhausted")
}
