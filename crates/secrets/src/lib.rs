//! Secret backends and the fallback chain that routes between them
//!
//! `pass`(1) is the preferred backend. When it is missing or failing the
//! chain falls back to owner-only files, except when the caller cancelled
//! or ran out of time.

pub mod chain;
pub mod file;
pub mod pass;

use std::path::PathBuf;
use std::sync::Arc;

pub use chain::ChainSecretStore;
pub use file::FileSecretStore;
pub use pass::PassSecretStore;

/// Pass first, files under `secrets_dir` second.
pub fn default_chain(secrets_dir: impl Into<PathBuf>) -> ChainSecretStore {
    ChainSecretStore::new(
        Arc::new(PassSecretStore::new()),
        Arc::new(FileSecretStore::new(secrets_dir)),
    )
}

/// Secret key holding an account's serialized OAuth tokens.
pub fn oauth_tokens_key(account_id: &str) -> String {
    format!("openai://{account_id}/oauth_tokens")
}

/// Secret key holding an account's API key.
pub fn api_key_key(account_id: &str) -> String {
    format!("openai://{account_id}/api_key")
}
