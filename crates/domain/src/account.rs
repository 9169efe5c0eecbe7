//! Account records: identity, auth material references, usage counters,
//! rate-limit snapshots and subscription state.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub type AccountId = String;

/// How an account authenticates against the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethod {
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "chatgpt")]
    ChatGpt,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::ApiKey => "api_key",
            AuthMethod::ChatGpt => "chatgpt",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "api_key" | "apikey" => Ok(AuthMethod::ApiKey),
            "chatgpt" => Ok(AuthMethod::ChatGpt),
            other => Err(Error::Validation(format!("unsupported auth method: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountMetadata {
    #[serde(default)]
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub secret_ref: String,
    #[serde(default)]
    pub plan_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<AuthMethod>,
    #[serde(default)]
    pub secret_ref: String,
}

/// Token counters accumulated for an account.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub cached_input_tokens: i64,
}

impl Usage {
    /// Input plus output tokens. Cached input is already counted in input.
    pub fn blended_total(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }
}

/// Render a token count as `999`, `1.2k` or `3.4M`.
pub fn compact_number(n: i64) -> String {
    if n < 1_000 {
        return n.to_string();
    }
    if n < 1_000_000 {
        return format!("{:.1}k", n as f64 / 1_000.0);
    }
    format!("{:.1}M", n as f64 / 1_000_000.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitKind {
    Daily,
    Weekly,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Daily => f.write_str("daily"),
            LimitKind::Weekly => f.write_str("weekly"),
        }
    }
}

/// One rate-limit window as last observed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitSnapshot {
    pub percent: f64,
    pub resets_at: DateTime<Utc>,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily: Option<LimitSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weekly: Option<LimitSnapshot>,
}

impl Limits {
    pub fn get(&self, kind: LimitKind) -> Option<&LimitSnapshot> {
        match kind {
            LimitKind::Daily => self.daily.as_ref(),
            LimitKind::Weekly => self.weekly.as_ref(),
        }
    }

    pub fn set(&mut self, kind: LimitKind, snapshot: LimitSnapshot) {
        match kind {
            LimitKind::Daily => self.daily = Some(snapshot),
            LimitKind::Weekly => self.weekly = Some(snapshot),
        }
    }

    /// Weekly used percent; an account without a snapshot counts as 0%.
    pub fn weekly_percent(&self) -> f64 {
        self.weekly.as_ref().map_or(0.0, |w| w.percent)
    }

    pub fn weekly_exhausted(&self) -> bool {
        self.weekly.as_ref().is_some_and(|w| w.percent >= 100.0)
    }

    /// Most recent capture time across both windows.
    pub fn last_captured_at(&self) -> Option<DateTime<Utc>> {
        [self.daily.as_ref(), self.weekly.as_ref()]
            .into_iter()
            .flatten()
            .map(|s| s.captured_at)
            .max()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_start: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub will_renew: bool,
    #[serde(default)]
    pub billing_period: String,
    #[serde(default)]
    pub billing_currency: String,
    #[serde(default)]
    pub is_delinquent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccountClassification {
    Unknown,
    Personal,
    Team,
    Business,
}

impl AccountClassification {
    pub fn from_plan_type(plan_type: &str) -> Self {
        match plan_type.trim().to_ascii_lowercase().as_str() {
            "" => AccountClassification::Unknown,
            "team" => AccountClassification::Team,
            "business" | "enterprise" | "education" | "edu" | "k12" | "quorum"
            | "free_workspace" => AccountClassification::Business,
            _ => AccountClassification::Personal,
        }
    }
}

impl fmt::Display for AccountClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AccountClassification::Unknown => "unknown",
            AccountClassification::Personal => "personal",
            AccountClassification::Team => "team",
            AccountClassification::Business => "business",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: AccountId,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub metadata: AccountMetadata,
    #[serde(default)]
    pub auth: Auth,
    #[serde(default)]
    pub usage: Usage,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription: Option<Subscription>,
}

impl Account {
    /// A fresh record with the default display name.
    pub fn new(id: impl Into<AccountId>) -> Self {
        let id = id.into();
        Self {
            name: format!("Account {id}"),
            id,
            ..Self::default()
        }
    }

    /// Distinct, non-empty secret references, metadata first.
    pub fn secret_refs(&self) -> Vec<String> {
        unique_refs([self.metadata.secret_ref.as_str(), self.auth.secret_ref.as_str()])
    }

    pub fn classification(&self) -> AccountClassification {
        AccountClassification::from_plan_type(&self.metadata.plan_type)
    }
}

/// Trim, drop blanks and de-duplicate, keeping first occurrence order.
pub(crate) fn unique_refs<'a>(refs: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for r in refs {
        let r = r.trim();
        if r.is_empty() || out.iter().any(|seen| seen == r) {
            continue;
        }
        out.push(r.to_owned());
    }
    out
}
