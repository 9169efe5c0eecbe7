//! Error types for account orchestration

use domain::{AccountId, SecretError};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Domain(#[from] domain::Error),

    #[error(transparent)]
    Secret(#[from] SecretError),

    #[error(transparent)]
    OAuth(#[from] oauth::Error),

    /// A forward step failed. `rollback` holds every compensation step that
    /// also failed; empty means the compensation went through.
    #[error("{step} failed: {source}{}", describe_rollback(.rollback))]
    Saga {
        step: &'static str,
        source: Box<Error>,
        rollback: Vec<Error>,
    },

    #[error(
        "account {account_id} must sign in again: run `oa login browser --account {account_id}`"
    )]
    ReauthRequired { account_id: AccountId },

    /// The provider rejected the access token (401/403).
    #[error("session expired: {0}")]
    SessionExpired(String),

    #[error("usage request failed: {0}")]
    Usage(String),

    #[error("operation cancelled")]
    Cancelled,

    /// A batch task panicked or was aborted before reporting.
    #[error("task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{} accounts failed: {}", .failures.len(), describe_failures(.failures))]
    BatchFailed { failures: Vec<(AccountId, Error)> },
}

fn describe_rollback(rollback: &[Error]) -> String {
    if rollback.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = rollback.iter().map(ToString::to_string).collect();
    format!("; rollback failed: {}", joined.join("; "))
}

fn describe_failures(failures: &[(AccountId, Error)]) -> String {
    let joined: Vec<String> = failures
        .iter()
        .map(|(id, e)| format!("{id}: {e}"))
        .collect();
    joined.join("; ")
}

impl Error {
    pub(crate) fn saga(step: &'static str, source: Error, rollback: Vec<Error>) -> Self {
        Error::Saga {
            step,
            source: Box::new(source),
            rollback,
        }
    }

    /// The forward failure underneath any saga wrapping.
    pub fn root(&self) -> &Error {
        match self {
            Error::Saga { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_reauth_required(&self) -> bool {
        matches!(self.root(), Error::ReauthRequired { .. })
    }

    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::Domain(e) => e.is_not_found(),
            Error::Secret(e) => e.is_not_found(),
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        match self.root() {
            Error::Cancelled | Error::OAuth(oauth::Error::Cancelled) => true,
            Error::Secret(e) => e.is_cancellation(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
