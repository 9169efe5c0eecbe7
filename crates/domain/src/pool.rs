//! Pools: named rotation groups of accounts sharing one provider.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::{Account, AccountId, AuthMethod, unique_refs};
use crate::error::{Error, Result};

pub type PoolId = String;

pub const DEFAULT_OPENAI_POOL_ID: &str = "default-openai";
pub const PROVIDER_OPENAI: &str = "openai";

const SUPPORTED_PROVIDERS: &[&str] = &[PROVIDER_OPENAI];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    /// Lowest weekly used percent first, account id as tie-break.
    #[default]
    LeastWeeklyUsed,
}

impl PoolStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolStrategy::LeastWeeklyUsed => "least_weekly_used",
        }
    }
}

impl fmt::Display for PoolStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pool {
    pub id: PoolId,
    pub name: String,
    pub provider: String,
    #[serde(default)]
    pub strategy: PoolStrategy,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub auto_sync_members: bool,
    #[serde(default)]
    pub members: Vec<AccountId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Pool {
    /// The built-in OpenAI pool, inactive until activated.
    pub fn default_openai() -> Self {
        Self {
            id: DEFAULT_OPENAI_POOL_ID.to_owned(),
            name: "default".to_owned(),
            provider: PROVIDER_OPENAI.to_owned(),
            strategy: PoolStrategy::LeastWeeklyUsed,
            active: false,
            auto_sync_members: true,
            members: Vec::new(),
            updated_at: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(Error::Validation("pool id is required".into()));
        }
        if self.name.trim().is_empty() {
            return Err(Error::Validation(format!("pool {} name is required", self.id)));
        }
        let provider = self.provider.trim();
        if provider.is_empty() {
            return Err(Error::Validation(format!(
                "pool {} provider is required",
                self.id
            )));
        }
        if !SUPPORTED_PROVIDERS.contains(&provider) {
            return Err(Error::Validation(format!(
                "pool {} has unsupported provider {provider:?}",
                self.id
            )));
        }
        Ok(())
    }

    pub fn normalize_members(&mut self) {
        self.members = normalize_members(self.members.iter().map(String::as_str));
    }
}

/// Trimmed, non-empty, de-duplicated member ids in first-seen order.
pub fn normalize_members<'a>(ids: impl IntoIterator<Item = &'a str>) -> Vec<AccountId> {
    unique_refs(ids)
}

/// The auth method a provider's OAuth login produces.
pub fn oauth_method_for(provider: &str) -> Option<AuthMethod> {
    match provider.trim().to_ascii_lowercase().as_str() {
        PROVIDER_OPENAI => Some(AuthMethod::ChatGpt),
        _ => None,
    }
}

/// Whether an account belongs in a pool for `provider`: its recorded
/// provider matches, or it was logged in with that provider's OAuth method.
pub fn matches_provider(account: &Account, provider: &str) -> bool {
    let provider = provider.trim().to_ascii_lowercase();
    if account.metadata.provider.trim().to_ascii_lowercase() == provider {
        return true;
    }
    match (account.auth.method, oauth_method_for(&provider)) {
        (Some(method), Some(expected)) => method == expected,
        _ => false,
    }
}
