//! Error types for the broker pipeline
//!
//! Every request failure collapses into one of these variants before it
//! reaches the HTTP layer; provider SDK error types never leave their module.
//! The status mapping intentionally reports upstream outages as 401 to stay
//! wire-compatible with existing callers.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::vault::VaultError;

/// Error type for broker operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Request body (or other caller input) could not be decoded
    #[error("malformed request: {0}")]
    Malformed(String),

    /// The source cloud did not confirm that the caller controls the claimed identity
    #[error("source identity could not be verified")]
    Unverified,

    /// No mapping in the current policy snapshot permits this assumption
    #[error("no mapping permits this identity assumption")]
    Unauthorized,

    /// The provider tag has no registered implementation
    #[error("provider not supported: {0}")]
    ProviderUnsupported(String),

    /// A cloud API could not be reached or rejected the call
    #[error("upstream provider error: {0}")]
    Upstream(String),

    /// The secret store could not serve a read
    #[error("secret store error: {0}")]
    SecretStore(String),

    /// Serialization or other programmer error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a malformed-request error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create an upstream error with the given message
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The HTTP status this error maps to
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Malformed(_) => StatusCode::BAD_REQUEST,
            Error::Unverified => StatusCode::UNAUTHORIZED,
            Error::Unauthorized => StatusCode::NOT_FOUND,
            // Upstream outages and unknown providers surface as 401 so callers
            // cannot distinguish them from a failed verification.
            Error::ProviderUnsupported(_) => StatusCode::UNAUTHORIZED,
            Error::Upstream(_) => StatusCode::UNAUTHORIZED,
            Error::SecretStore(_) => StatusCode::UNAUTHORIZED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        // 400/500 carry a plain-text cause; auth failures stay bodyless.
        match status {
            StatusCode::BAD_REQUEST | StatusCode::INTERNAL_SERVER_ERROR => {
                (status, self.to_string()).into_response()
            }
            _ => status.into_response(),
        }
    }
}

impl From<VaultError> for Error {
    fn from(e: VaultError) -> Self {
        Error::SecretStore(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Upstream(e.to_string())
    }
}
