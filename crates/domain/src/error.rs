//! Sentinels for repository and secret-store failures

use crate::account::AccountId;
use crate::pool::PoolId;

/// Errors from records and repositories.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("account not found: {0}")]
    AccountNotFound(AccountId),

    #[error("pool not found: {0}")]
    PoolNotFound(PoolId),

    #[error("pool runtime not found: {0}")]
    RuntimeNotFound(PoolId),

    #[error("pool {0} is deactivated")]
    PoolInactive(PoolId),

    #[error("no eligible accounts in pool {0}")]
    NoEligibleAccounts(PoolId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::AccountNotFound(_) | Error::PoolNotFound(_) | Error::RuntimeNotFound(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Errors from secret backends.
#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("secret backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid secret key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("secret operation cancelled")]
    Cancelled,

    #[error("secret operation deadline exceeded")]
    DeadlineExceeded,

    #[error("secret backend error: {0}")]
    Backend(String),

    #[error("primary backend {op} failed: {primary}; fallback backend {op} failed: {fallback}")]
    Chain {
        op: &'static str,
        primary: Box<SecretError>,
        fallback: Box<SecretError>,
    },
}

impl SecretError {
    /// The caller gave up; switching backends would mask that.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, SecretError::Cancelled | SecretError::DeadlineExceeded)
    }

    /// Missing key, including a chain where every backend reported it missing.
    pub fn is_not_found(&self) -> bool {
        match self {
            SecretError::NotFound(_) => true,
            SecretError::Chain {
                primary, fallback, ..
            } => primary.is_not_found() && fallback.is_not_found(),
            _ => false,
        }
    }
}

pub type SecretResult<T> = std::result::Result<T, SecretError>;
