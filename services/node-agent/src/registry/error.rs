//! Registry error taxonomy.

use thiserror::Error;

/// Errors from a registry backend.
///
/// Every variant knows whether retrying the same request can succeed;
/// callers drive their backoff loops from [`RegistryError::is_retryable`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The reference or blob does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials were rejected or are missing.
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Network failure, connection reset, 429 or 5xx.
    #[error("registry unavailable: {0}")]
    Unavailable(String),

    /// The request did not complete in time.
    #[error("registry request timed out")]
    Timeout,

    /// The server refused the requested byte range.
    #[error("range not satisfiable at offset {offset}")]
    RangeNotSatisfiable { offset: u64 },

    /// Any other non-success status; retrying will not change it.
    #[error("registry rejected request with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The registry answered with something that is not a usable manifest.
    #[error("invalid manifest: {0}")]
    InvalidManifest(String),
}

impl RegistryError {
    /// Returns true if the same request may succeed later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Timeout | Self::RangeNotSatisfiable { .. }
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if err.is_decode() {
            Self::InvalidManifest(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}
