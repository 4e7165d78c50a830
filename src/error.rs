//! Error types for subscription conversion and caching

use thiserror::Error;

/// Result type alias for conversion and cache operations
pub type Result<T> = std::result::Result<T, ConvertError>;

/// Error types that can occur while fetching, converting or caching subscriptions
#[derive(Error, Debug, Clone)]
pub enum ConvertError {
    /// Malformed base64 at the subscription (outer) layer
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// A single subscription line could not be decoded into a descriptor
    #[error("Decoding error: {reason} (line: {line})")]
    Decoding { line: String, reason: String },

    #[error("Converter does not exist: {0}")]
    ConverterNotFound(String),

    /// Network failure or non-success status from the subscription source
    #[error("Fetch error: {message}")]
    Fetch { status: Option<u16>, message: String },

    /// Snapshot read/write failure. Never surfaced to callers of the manager.
    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    IoError(String),

    /// Malformed inbound HTTP request
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Cache manager has been shut down")]
    ShutDown,
}

impl From<std::io::Error> for ConvertError {
    fn from(err: std::io::Error) -> Self {
        ConvertError::IoError(err.to_string())
    }
}

impl ConvertError {
    /// Create a Decoding error for the given subscription line
    pub fn decoding(line: impl Into<String>, reason: impl Into<String>) -> Self {
        ConvertError::Decoding {
            line: line.into(),
            reason: reason.into(),
        }
    }

    /// Create a Fetch error from a non-success HTTP status
    pub fn fetch_status(status: u16, message: impl Into<String>) -> Self {
        ConvertError::Fetch {
            status: Some(status),
            message: format!("http_code={} {}", status, message.into()),
        }
    }

    /// Create a Fetch error for a transport-level failure (no status)
    pub fn fetch(message: impl Into<String>) -> Self {
        ConvertError::Fetch {
            status: None,
            message: message.into(),
        }
    }

    /// Status code returned by the subscription source, if any
    pub fn upstream_status(&self) -> Option<u16> {
        match self {
            ConvertError::Fetch { status, .. } => *status,
            _ => None,
        }
    }

    /// Convert error to HTTP status code for the inbound boundary
    ///
    /// - Bad subscription content, an unknown converter or a malformed request: 400
    /// - Upstream failures: 502
    /// - Everything else: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            ConvertError::Encoding(_) => 400,
            ConvertError::Decoding { .. } => 400,
            ConvertError::ConverterNotFound(_) => 400,
            ConvertError::BadRequest(_) => 400,
            ConvertError::Fetch { .. } => 502,
            ConvertError::ShutDown => 503,
            ConvertError::Persistence(_) => 500,
            ConvertError::ConfigError(_) => 500,
            ConvertError::Serialization(_) => 500,
            ConvertError::IoError(_) => 500,
        }
    }
}
