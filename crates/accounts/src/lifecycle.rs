//! Credential rotation across the secret store and the account repository.
//!
//! The two stores cannot commit together, so `set_auth` and `remove_auth`
//! run as ordered forward steps, each with a compensating action that runs
//! before an error is returned:
//!
//! | step | compensation |
//! |---|---|
//! | put new secret | none (nothing else has changed) |
//! | save account pointing at the new key | delete the new secret |
//! | delete each previous secret | point the account back at the undeleted references, then delete the new secret |
//!
//! A failed call leaves the account referencing secrets that still exist.

use std::sync::Arc;

use common::SecretString;
use domain::{Account, AccountRepository, Auth, AuthMethod, SecretStore};
use tracing::{info, warn};

use crate::error::{Error, Result};

pub struct CredentialLifecycle {
    accounts: Arc<dyn AccountRepository>,
    secrets: Arc<dyn SecretStore>,
}

impl CredentialLifecycle {
    pub fn new(accounts: Arc<dyn AccountRepository>, secrets: Arc<dyn SecretStore>) -> Self {
        Self { accounts, secrets }
    }

    /// Store `value` under `new_key` and make it the account's only secret.
    ///
    /// Creates the account with a default name when it does not exist yet.
    pub async fn set_auth(
        &self,
        account_id: &str,
        method: AuthMethod,
        new_key: &str,
        value: &SecretString,
    ) -> Result<Account> {
        let account_id = account_id.trim();
        let new_key = new_key.trim();
        if account_id.is_empty() {
            return Err(domain::Error::Validation("account id is required".into()).into());
        }
        if new_key.is_empty() {
            return Err(domain::Error::Validation("secret key is required".into()).into());
        }
        if value.expose().trim().is_empty() {
            return Err(domain::Error::Validation("secret value is required".into()).into());
        }

        let original = match self.accounts.get_by_id(account_id).await {
            Ok(account) => account,
            Err(domain::Error::AccountNotFound(_)) => Account::new(account_id),
            Err(e) => return Err(e.into()),
        };
        let previous = original.secret_refs();
        // Rewriting the key the account already uses leaves nothing to roll
        // back to: the old value is gone once the put succeeds.
        let key_in_use = previous.iter().any(|r| r == new_key);

        self.secrets.put(new_key, value.expose()).await?;

        let mut updated = original.clone();
        updated.auth = Auth {
            method: Some(method),
            secret_ref: new_key.to_owned(),
        };
        updated.metadata.secret_ref = new_key.to_owned();

        if let Err(e) = self.accounts.save(&updated).await {
            warn!(account_id, error = %e, "account save failed, discarding new secret");
            let mut rollback = Vec::new();
            if !key_in_use {
                if let Err(de) = self.discard(new_key).await {
                    rollback.push(de);
                }
            }
            return Err(Error::saga("save account", e.into(), rollback));
        }

        for (i, old) in previous.iter().enumerate() {
            if old == new_key {
                continue;
            }
            if let Err(e) = self.discard(old).await {
                let remaining: Vec<String> = previous[i..]
                    .iter()
                    .filter(|r| r.as_str() != new_key)
                    .cloned()
                    .collect();
                warn!(
                    account_id,
                    secret_ref = %old,
                    error = %e,
                    "previous secret delete failed, restoring account references"
                );
                let rollback = self.restore(&original, &remaining, Some(new_key)).await;
                return Err(Error::saga("delete previous secret", e, rollback));
            }
        }

        info!(account_id, method = %method, replaced = previous.len(), "credential stored");
        Ok(updated)
    }

    /// Detach every secret from the account and delete them.
    pub async fn remove_auth(&self, account_id: &str) -> Result<Account> {
        let account_id = account_id.trim();
        let original = self.accounts.get_by_id(account_id).await?;
        let previous = original.secret_refs();

        let mut cleared = original.clone();
        cleared.auth = Auth::default();
        cleared.metadata.secret_ref.clear();
        self.accounts.save(&cleared).await?;

        for (i, old) in previous.iter().enumerate() {
            if let Err(e) = self.discard(old).await {
                warn!(
                    account_id,
                    secret_ref = %old,
                    error = %e,
                    "secret delete failed, restoring account references"
                );
                let rollback = self.restore(&original, &previous[i..], None).await;
                return Err(Error::saga("delete secret", e, rollback));
            }
        }

        info!(account_id, removed = previous.len(), "credentials removed");
        Ok(cleared)
    }

    /// Delete a secret; one that is already gone counts as deleted.
    async fn discard(&self, key: &str) -> Result<()> {
        match self.secrets.delete(key).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(Error::Secret(e)),
        }
    }

    /// Point the account back at `remaining`, then drop `orphan` once
    /// nothing references it. Returns every compensation failure.
    async fn restore(
        &self,
        original: &Account,
        remaining: &[String],
        orphan: Option<&str>,
    ) -> Vec<Error> {
        let mut failures = Vec::new();
        let restored = with_refs(original, remaining);
        if let Err(e) = self.accounts.save(&restored).await {
            // The saved record still names `orphan`, so it must stay.
            failures.push(e.into());
            return failures;
        }
        if let Some(orphan) = orphan {
            if let Err(e) = self.discard(orphan).await {
                failures.push(e);
            }
        }
        failures
    }
}

/// `original` referencing only `remaining`: the first as the metadata
/// reference, the second (or the first again) as the auth reference.
fn with_refs(original: &Account, remaining: &[String]) -> Account {
    let mut account = original.clone();
    account.metadata.secret_ref = remaining.first().cloned().unwrap_or_default();
    account.auth.secret_ref = remaining
        .get(1)
        .or(remaining.first())
        .cloned()
        .unwrap_or_default();
    if remaining.is_empty() {
        account.auth.method = None;
    }
    account
}
