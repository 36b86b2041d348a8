use thiserror::Error;

/// Failures of a remote data call.
///
/// Cloneable so a single in-flight fetch can hand the same outcome to every
/// caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    /// The request never got a response (connect failure, timeout, reset).
    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Rejected on the client before any request was issued.
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Network blips and 5xx answers are worth retrying; everything else is
    /// a definitive answer.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// HTTP status carried by the error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ApiError::Server { status, .. } => Some(*status),
            ApiError::NotFound(_) => Some(404),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::Server {
                status: status.as_u16(),
                message: err.to_string(),
            }
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

/// Failures of the push channel and its transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PushError {
    #[error("Failed to connect to push hub: {0}")]
    Connect(String),

    #[error("Hub handshake rejected: {0}")]
    Handshake(String),

    #[error("Hub protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed: {0}")]
    Closed(String),

    #[error("Push channel stopped")]
    Stopped,
}

pub type Result<T> = std::result::Result<T, ApiError>;
