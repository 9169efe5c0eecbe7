//! Error types for OAuth operations

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Missing or malformed input; nothing was sent.
    #[error("invalid OAuth request: {0}")]
    InvalidRequest(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("token endpoint returned {status}: {message}")]
    TokenEndpoint { status: u16, message: String },

    /// The refresh token is no longer accepted. Only a new login helps.
    #[error("refresh token rejected: {0}")]
    InvalidGrant(String),

    #[error("authorization denied: {0}")]
    AccessDenied(String),

    #[error("device code expired: {0}")]
    ExpiredToken(String),

    #[error("timed out waiting for device authorization")]
    DeviceFlowTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("oauth callback failed: {0}")]
    Callback(String),

    #[error("timed out waiting for the browser callback after {0:?}")]
    CallbackTimeout(Duration),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl Error {
    pub fn is_invalid_grant(&self) -> bool {
        matches!(self, Error::InvalidGrant(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
