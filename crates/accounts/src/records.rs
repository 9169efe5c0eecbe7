//! Account record updates that do not touch credentials: usage counters,
//! limit snapshots, names, plan types and subscriptions.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use domain::{
    Account, AccountClassification, AccountId, AccountRepository, AuthMethod, LimitKind,
    LimitSnapshot, Subscription, Usage,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;
use crate::usage::UsageSnapshot;

/// A read-only view of an account for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountStatus {
    pub id: AccountId,
    pub name: String,
    pub auth_method: Option<AuthMethod>,
    pub has_credentials: bool,
    pub plan_type: String,
    pub classification: AccountClassification,
    pub usage: Usage,
    pub daily: Option<LimitSnapshot>,
    pub weekly: Option<LimitSnapshot>,
    pub subscription: Option<Subscription>,
}

impl From<&Account> for AccountStatus {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            auth_method: account.auth.method,
            has_credentials: !account.secret_refs().is_empty(),
            plan_type: account.metadata.plan_type.clone(),
            classification: account.classification(),
            usage: account.usage,
            daily: account.limits.daily.clone(),
            weekly: account.limits.weekly.clone(),
            subscription: account.subscription.clone(),
        }
    }
}

pub struct AccountRecords {
    accounts: Arc<dyn AccountRepository>,
    // Serializes read-modify-write cycles issued through this service.
    write: Mutex<()>,
}

impl AccountRecords {
    pub fn new(accounts: Arc<dyn AccountRepository>) -> Self {
        Self {
            accounts,
            write: Mutex::new(()),
        }
    }

    async fn update(&self, account_id: &str, apply: impl FnOnce(&mut Account)) -> Result<Account> {
        let _guard = self.write.lock().await;
        let mut account = self.accounts.get_by_id(account_id.trim()).await?;
        apply(&mut account);
        self.accounts.save(&account).await?;
        Ok(account)
    }

    pub async fn set_usage(&self, account_id: &str, usage: Usage) -> Result<Account> {
        self.update(account_id, |a| a.usage = usage).await
    }

    pub async fn set_limit(
        &self,
        account_id: &str,
        kind: LimitKind,
        snapshot: LimitSnapshot,
    ) -> Result<Account> {
        self.update(account_id, |a| a.limits.set(kind, snapshot))
            .await
    }

    pub async fn set_name(&self, account_id: &str, name: &str) -> Result<Account> {
        let name = name.trim();
        if name.is_empty() {
            return Err(domain::Error::Validation("account name is required".into()).into());
        }
        self.update(account_id, |a| a.name = name.to_owned()).await
    }

    pub async fn set_plan_type(&self, account_id: &str, plan_type: &str) -> Result<Account> {
        self.update(account_id, |a| a.metadata.plan_type = plan_type.trim().to_owned())
            .await
    }

    pub async fn set_subscription(
        &self,
        account_id: &str,
        subscription: Subscription,
    ) -> Result<Account> {
        self.update(account_id, |a| a.subscription = Some(subscription))
            .await
    }

    /// Write everything one usage fetch learned in a single save.
    pub async fn record_fetch(
        &self,
        account_id: &str,
        snapshot: &UsageSnapshot,
        subscription: Option<Subscription>,
        email: Option<&str>,
        captured_at: DateTime<Utc>,
    ) -> Result<Account> {
        let account = self
            .update(account_id, |a| {
                if let Some(daily) = &snapshot.daily {
                    a.limits.set(LimitKind::Daily, daily.snapshot(captured_at));
                }
                if let Some(weekly) = &snapshot.weekly {
                    a.limits.set(LimitKind::Weekly, weekly.snapshot(captured_at));
                }
                if !snapshot.plan_type.is_empty() {
                    a.metadata.plan_type = snapshot.plan_type.clone();
                }
                if let Some(mut subscription) = subscription {
                    subscription.captured_at = Some(captured_at);
                    a.subscription = Some(subscription);
                }
                // Names the user chose are kept; only the placeholder is replaced.
                if let Some(email) = email.map(str::trim).filter(|e| !e.is_empty()) {
                    if a.name.trim().is_empty() || a.name == Account::new(a.id.as_str()).name {
                        a.name = email.to_owned();
                    }
                }
            })
            .await?;
        debug!(account_id, weekly = account.limits.weekly_percent(), "usage recorded");
        Ok(account)
    }

    pub async fn status(&self, account_id: &str) -> Result<AccountStatus> {
        let account = self.accounts.get_by_id(account_id.trim()).await?;
        Ok(AccountStatus::from(&account))
    }

    /// Every account, ordered by id.
    pub async fn status_all(&self) -> Result<Vec<AccountStatus>> {
        let mut statuses: Vec<AccountStatus> = self
            .accounts
            .list()
            .await?
            .iter()
            .map(AccountStatus::from)
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(statuses)
    }
}
