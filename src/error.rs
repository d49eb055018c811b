use thiserror::Error;

/// Unified error type for the Courier fetch engine
#[derive(Error, Debug)]
pub enum CourierError {
    // Proxy errors
    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("No slot on proxy {proxy} within {waited_ms}ms")]
    SlotTimeout { proxy: String, waited_ms: u64 },

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Connect timeout")]
    ConnectTimeout,

    #[error("Request timeout")]
    RequestTimeout,

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Payload rejected: {0}")]
    InvalidPayload(String),

    // Resolution errors
    #[error("No candidate URLs for chapter {0}")]
    NoCandidates(String),

    #[error("Chapter resolution failed: {0}")]
    ResolutionFailed(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation cancelled")]
    Cancelled,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for Courier operations
pub type Result<T> = std::result::Result<T, CourierError>;

impl CourierError {
    /// Whether another attempt at the same URL may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            CourierError::ProxyConnectionFailed(_)
            | CourierError::SlotTimeout { .. }
            | CourierError::ConnectTimeout
            | CourierError::RequestTimeout
            | CourierError::Http(_)
            | CourierError::InvalidPayload(_) => true,

            CourierError::InvalidProxyAddress(_)
            | CourierError::UnsupportedProtocol(_)
            | CourierError::InvalidRequest(_)
            | CourierError::NoCandidates(_)
            | CourierError::ResolutionFailed(_)
            | CourierError::InvalidConfig(_)
            | CourierError::Cancelled
            | CourierError::Io(_)
            | CourierError::Json(_)
            | CourierError::Internal(_) => false,
        }
    }

    /// Check if this error is a timeout of any kind
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            CourierError::ConnectTimeout
                | CourierError::RequestTimeout
                | CourierError::SlotTimeout { .. }
        )
    }
}

// Convert from reqwest errors, keeping the timeout/connect distinction
impl From<reqwest::Error> for CourierError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            if err.is_connect() {
                CourierError::ConnectTimeout
            } else {
                CourierError::RequestTimeout
            }
        } else if err.is_connect() {
            CourierError::ProxyConnectionFailed(err.without_url().to_string())
        } else if err.is_builder() {
            CourierError::InvalidRequest(err.to_string())
        } else {
            CourierError::Http(err.without_url().to_string())
        }
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for CourierError {
    fn from(err: url::ParseError) -> Self {
        CourierError::InvalidProxyAddress(err.to_string())
    }
}
