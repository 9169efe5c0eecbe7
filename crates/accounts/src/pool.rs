//! Pool membership and least-weekly-used account selection
//!
//! Membership is decided by one predicate, [`domain::matches_provider`]: an
//! account belongs to a pool when its recorded provider matches or it was
//! logged in with the provider's OAuth method. Auto-sync pools recompute
//! their members from that predicate on activation and whenever they are
//! read.
//!
//! Selection order: weekly used percent ascending (no snapshot counts as
//! 0%), then account id. Accounts at or above 100% weekly are excluded.

use std::cmp::Ordering;
use std::sync::Arc;

use domain::{
    Account, AccountId, AccountRepository, Clock, DEFAULT_OPENAI_POOL_ID, Pool, PoolRepository,
    matches_provider, normalize_members,
};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;
use crate::session::SessionService;

/// The selected account and the rest of the eligible set, best first.
#[derive(Debug, Clone)]
pub struct Pick {
    pub account: Account,
    pub failover: Vec<Account>,
}

/// The only writer of pool membership and activation state.
pub struct PoolService {
    accounts: Arc<dyn AccountRepository>,
    pools: Arc<dyn PoolRepository>,
    sessions: Arc<SessionService>,
    clock: Arc<dyn Clock>,
}

fn pick_order(a: &Account, b: &Account) -> Ordering {
    a.limits
        .weekly_percent()
        .total_cmp(&b.limits.weekly_percent())
        .then_with(|| a.id.cmp(&b.id))
}

impl PoolService {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        pools: Arc<dyn PoolRepository>,
        sessions: Arc<SessionService>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            pools,
            sessions,
            clock,
        }
    }

    /// The stored pool; the built-in default pool reads as inactive and
    /// empty until it is first saved.
    async fn load(&self, pool_id: &str) -> Result<Pool> {
        match self.pools.get_by_id(pool_id).await {
            Ok(pool) => Ok(pool),
            Err(domain::Error::PoolNotFound(_)) if pool_id == DEFAULT_OPENAI_POOL_ID => {
                Ok(Pool::default_openai())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Ids of every account matching `provider`, in repository order.
    async fn matching_members(&self, provider: &str) -> Result<Vec<AccountId>> {
        let accounts = self.accounts.list().await?;
        Ok(normalize_members(
            accounts
                .iter()
                .filter(|a| matches_provider(a, provider))
                .map(|a| a.id.as_str()),
        ))
    }

    pub async fn activate_default_pool(&self) -> Result<Pool> {
        self.activate_pool(DEFAULT_OPENAI_POOL_ID).await
    }

    pub async fn activate_pool(&self, pool_id: &str) -> Result<Pool> {
        let mut pool = self.load(pool_id.trim()).await?;
        if pool.auto_sync_members {
            pool.members = self.matching_members(&pool.provider).await?;
        } else {
            pool.normalize_members();
        }
        pool.active = true;
        pool.updated_at = Some(self.clock.now());
        self.pools.save(&pool).await?;
        info!(pool_id = %pool.id, members = pool.members.len(), "pool activated");
        Ok(pool)
    }

    pub async fn deactivate_pool(&self, pool_id: &str) -> Result<Pool> {
        let mut pool = self.pools.get_by_id(pool_id.trim()).await?;
        pool.active = false;
        pool.updated_at = Some(self.clock.now());
        self.pools.save(&pool).await?;
        info!(pool_id = %pool.id, "pool deactivated");
        Ok(pool)
    }

    /// The pool as selection sees it: auto-sync pools carry freshly
    /// computed members. Nothing is persisted.
    pub async fn get_pool(&self, pool_id: &str) -> Result<Pool> {
        let mut pool = self.load(pool_id.trim()).await?;
        if pool.auto_sync_members {
            pool.members = self.matching_members(&pool.provider).await?;
        }
        Ok(pool)
    }

    /// Eligible members in pick order. Fails when the pool is inactive.
    pub async fn eligible_accounts(&self, pool_id: &str) -> Result<Vec<Account>> {
        let pool = self.get_pool(pool_id).await?;
        if !pool.active {
            return Err(domain::Error::PoolInactive(pool.id).into());
        }

        let accounts = self.accounts.list().await?;
        let mut eligible: Vec<Account> = pool
            .members
            .iter()
            .filter_map(|id| accounts.iter().find(|a| &a.id == id))
            .filter(|a| matches_provider(a, &pool.provider))
            .filter(|a| !a.limits.weekly_exhausted())
            .cloned()
            .collect();
        eligible.sort_by(pick_order);
        debug!(pool_id = %pool.id, eligible = eligible.len(), "computed eligible accounts");
        Ok(eligible)
    }

    pub async fn is_eligible_account(&self, pool_id: &str, account_id: &str) -> Result<bool> {
        let account_id = account_id.trim();
        Ok(self
            .eligible_accounts(pool_id)
            .await?
            .iter()
            .any(|a| a.id == account_id))
    }

    pub async fn pick_account(&self, pool_id: &str) -> Result<Pick> {
        let result = self.pick(pool_id).await;
        let outcome = match &result {
            Ok(_) => "picked",
            Err(Error::Domain(domain::Error::PoolInactive(_))) => "inactive",
            Err(Error::Domain(domain::Error::NoEligibleAccounts(_))) => "no_eligible",
            Err(_) => "error",
        };
        metrics::record_pick(outcome);
        match &result {
            Ok(pick) => info!(
                pool_id,
                account_id = %pick.account.id,
                weekly_percent = pick.account.limits.weekly_percent(),
                failover = pick.failover.len(),
                "account picked"
            ),
            Err(e) => warn!(pool_id, error = %e, "no account picked"),
        }
        result
    }

    async fn pick(&self, pool_id: &str) -> Result<Pick> {
        let mut eligible = self.eligible_accounts(pool_id).await?.into_iter();
        let Some(account) = eligible.next() else {
            return Err(domain::Error::NoEligibleAccounts(pool_id.trim().to_owned()).into());
        };
        Ok(Pick {
            account,
            failover: eligible.collect(),
        })
    }

    /// The eligible account after `current` in pick order, wrapping around.
    /// Starts from the best account when `current` is absent or ineligible.
    pub async fn next_account(&self, pool_id: &str, current: Option<&str>) -> Result<Account> {
        let eligible = self.eligible_accounts(pool_id).await?;
        if eligible.is_empty() {
            return Err(domain::Error::NoEligibleAccounts(pool_id.trim().to_owned()).into());
        }
        let next = current
            .map(str::trim)
            .and_then(|current| eligible.iter().position(|a| a.id == current))
            .map_or(0, |i| (i + 1) % eligible.len());
        Ok(eligible[next].clone())
    }

    /// Make the eligible account matching `selector` (id, else name
    /// ignoring case) the pool's active account.
    pub async fn switch_account(&self, pool_id: &str, selector: &str) -> Result<Account> {
        let selector = selector.trim();
        let eligible = self.eligible_accounts(pool_id).await?;
        let chosen = eligible
            .iter()
            .find(|a| a.id == selector)
            .or_else(|| {
                eligible
                    .iter()
                    .find(|a| a.name.trim().eq_ignore_ascii_case(selector))
            })
            .cloned()
            .ok_or_else(|| {
                domain::Error::Validation(format!(
                    "no eligible account matches {selector:?} in pool {}",
                    pool_id.trim()
                ))
            })?;
        self.sessions
            .set_active_account_id(pool_id, &chosen.id)
            .await?;
        info!(pool_id, account_id = %chosen.id, "switched active account");
        Ok(chosen)
    }
}
