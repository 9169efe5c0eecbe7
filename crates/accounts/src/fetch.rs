//! Usage fetching for one account or many in parallel.
//!
//! A batch runs at most `max_concurrent` fetches at once. Each account
//! fails on its own: the report lists successes next to per-account
//! failures, and only a batch where every account failed is an error.
//! Cancellation stops new fetches from starting; those accounts are
//! reported as cancelled.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;
use domain::{Account, AccountId, AccountRepository, AuthMethod, Clock};
use oauth::OAuthTokens;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::freshness::TokenFreshness;
use crate::metrics;
use crate::records::AccountRecords;
use crate::usage::{UsageSnapshot, UsageSource};

pub const DEFAULT_MAX_CONCURRENT: usize = 5;
pub const DEFAULT_CACHE_TTL: Duration = Duration::minutes(5);

#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Fetched(Account),
    /// The last snapshot is younger than the cache TTL.
    Skipped(Account),
}

impl FetchOutcome {
    pub fn account(&self) -> &Account {
        match self {
            FetchOutcome::Fetched(a) | FetchOutcome::Skipped(a) => a,
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub fetched: Vec<Account>,
    pub skipped: Vec<Account>,
    pub failures: Vec<(AccountId, Error)>,
}

pub struct UsageFetcher {
    accounts: Arc<dyn AccountRepository>,
    records: Arc<AccountRecords>,
    freshness: Arc<TokenFreshness>,
    source: Arc<dyn UsageSource>,
    clock: Arc<dyn Clock>,
    max_concurrent: usize,
    cache_ttl: Duration,
}

impl UsageFetcher {
    pub fn new(
        accounts: Arc<dyn AccountRepository>,
        records: Arc<AccountRecords>,
        freshness: Arc<TokenFreshness>,
        source: Arc<dyn UsageSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            accounts,
            records,
            freshness,
            source,
            clock,
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            cache_ttl: DEFAULT_CACHE_TTL,
        }
    }

    /// Clamped to at least one.
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent.max(1);
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    async fn call_usage(
        &self,
        tokens: &OAuthTokens,
        cancel: &CancellationToken,
    ) -> Result<UsageSnapshot> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.source.fetch_usage(tokens) => result,
        }
    }

    /// Fetch usage for one account and record it.
    ///
    /// A rejected access token triggers one forced refresh and a retry; a
    /// second rejection means the account must sign in again.
    pub async fn fetch_one(
        &self,
        account_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let result = self.fetch(account_id.trim(), force, cancel).await;
        metrics::record_usage_fetch(match &result {
            Ok(FetchOutcome::Fetched(_)) => "fetched",
            Ok(FetchOutcome::Skipped(_)) => "skipped",
            Err(e) if e.is_cancelled() => "cancelled",
            Err(_) => "failed",
        });
        result
    }

    async fn fetch(
        &self,
        account_id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome> {
        let account = self.accounts.get_by_id(account_id).await?;
        if account.auth.method != Some(AuthMethod::ChatGpt) {
            return Err(Error::Usage(format!(
                "account {account_id} is not signed in with ChatGPT"
            )));
        }

        let now = self.clock.now();
        if !force {
            if let Some(captured) = account.limits.last_captured_at() {
                if now - captured < self.cache_ttl {
                    debug!(account_id, "usage snapshot still fresh, skipping");
                    return Ok(FetchOutcome::Skipped(account));
                }
            }
        }

        let tokens = self
            .freshness
            .ensure_fresh_tokens(&account, None, false, cancel)
            .await?;
        let (snapshot, tokens) = match self.call_usage(&tokens, cancel).await {
            Err(Error::SessionExpired(reason)) => {
                info!(account_id, %reason, "usage request rejected, forcing token refresh");
                let refreshed = self
                    .freshness
                    .ensure_fresh_tokens(&account, Some(&tokens), true, cancel)
                    .await?;
                match self.call_usage(&refreshed, cancel).await {
                    Err(Error::SessionExpired(reason)) => {
                        warn!(account_id, %reason, "usage rejected after refresh");
                        return Err(Error::ReauthRequired {
                            account_id: account.id.clone(),
                        });
                    }
                    other => (other?, refreshed),
                }
            }
            other => (other?, tokens),
        };

        let subscription = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = self.source.fetch_subscription(&tokens) => match result {
                Ok(subscription) => subscription,
                Err(e) => {
                    warn!(account_id, error = %e, "subscription fetch failed");
                    None
                }
            },
        };

        let claims = tokens.claims();
        let account = self
            .records
            .record_fetch(
                account_id,
                &snapshot,
                subscription,
                claims.email.as_deref(),
                self.clock.now(),
            )
            .await?;
        Ok(FetchOutcome::Fetched(account))
    }

    /// Fetch every account in `account_ids`, or every ChatGPT account when
    /// `None`.
    pub async fn fetch_all(
        self: &Arc<Self>,
        account_ids: Option<Vec<AccountId>>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport> {
        let ids = match account_ids {
            Some(ids) => ids,
            None => self
                .accounts
                .list()
                .await?
                .into_iter()
                .filter(|a| a.auth.method == Some(AuthMethod::ChatGpt))
                .map(|a| a.id)
                .collect(),
        };
        let total = ids.len();
        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();
        let mut spawned = HashMap::new();
        let mut report = BatchReport::default();

        for id in ids {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                permit = permits.clone().acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                report.failures.push((id, Error::Cancelled));
                continue;
            };
            let fetcher = Arc::clone(self);
            let cancel = cancel.clone();
            let task_id = id.clone();
            let handle = tasks.spawn(async move {
                let _permit = permit;
                let result = fetcher.fetch_one(&task_id, force, &cancel).await;
                (task_id, result)
            });
            spawned.insert(handle.id(), id);
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(FetchOutcome::Fetched(account)))) => report.fetched.push(account),
                Ok((_, Ok(FetchOutcome::Skipped(account)))) => report.skipped.push(account),
                Ok((id, Err(e))) => {
                    warn!(account_id = %id, error = %e, "usage fetch failed");
                    report.failures.push((id, e));
                }
                Err(e) => {
                    // Every spawned task has an entry, so a panic still
                    // counts as a failure of its account.
                    if let Some(id) = spawned.remove(&e.id()) {
                        warn!(account_id = %id, error = %e, "usage fetch task aborted");
                        report.failures.push((id, Error::Task(e)));
                    } else {
                        warn!(error = %e, "usage fetch task aborted");
                    }
                }
            }
        }

        report.fetched.sort_by(|a, b| a.id.cmp(&b.id));
        report.skipped.sort_by(|a, b| a.id.cmp(&b.id));
        report.failures.sort_by(|a, b| a.0.cmp(&b.0));
        info!(
            total,
            fetched = report.fetched.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "usage batch finished"
        );

        if total > 0 && report.failures.len() == total {
            let mut failures = report.failures;
            if failures.len() == 1 {
                if let Some((_, e)) = failures.pop() {
                    return Err(e);
                }
            }
            return Err(Error::BatchFailed { failures });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::freshness::TokenRefresher;
    use crate::test_support::{MemoryAccounts, MemorySecrets, start_time};
    use domain::{BoxFuture, LimitKind, LimitSnapshot, ManualClock, Subscription};
    use oauth::TokenResponse;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::usage::WindowUsage;

    /// Accepts only access tokens in `valid`; tracks peak concurrency.
    #[derive(Default)]
    struct FakeSource {
        valid: Mutex<HashSet<String>>,
        failing: HashSet<String>,
        panicking: HashSet<String>,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: std::time::Duration,
    }

    impl FakeSource {
        fn accepting(tokens: &[&str]) -> Self {
            Self {
                valid: Mutex::new(tokens.iter().map(|t| (*t).to_owned()).collect()),
                ..Self::default()
            }
        }
    }

    impl UsageSource for FakeSource {
        fn fetch_usage<'a>(
            &'a self,
            tokens: &'a OAuthTokens,
        ) -> BoxFuture<'a, Result<UsageSnapshot>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(self.delay).await;
                self.in_flight.fetch_sub(1, Ordering::SeqCst);

                if self.panicking.contains(&tokens.access_token) {
                    panic!("usage source crashed");
                }
                if self.failing.contains(&tokens.access_token) {
                    return Err(Error::Usage("usage endpoint returned 500".into()));
                }
                if !self.valid.lock().unwrap().contains(&tokens.access_token) {
                    return Err(Error::SessionExpired("usage request returned 401".into()));
                }
                Ok(UsageSnapshot {
                    plan_type: "plus".into(),
                    daily: None,
                    weekly: Some(WindowUsage {
                        used_percent: 25.0,
                        window_seconds: 7 * 86400,
                        resets_at: start_time() + Duration::days(3),
                    }),
                })
            })
        }

        fn fetch_subscription<'a>(
            &'a self,
            _tokens: &'a OAuthTokens,
        ) -> BoxFuture<'a, Result<Option<Subscription>>> {
            Box::pin(async { Err(Error::Usage("subscription endpoint returned 503".into())) })
        }
    }

    /// Refreshes `rt-{id}` to `at-{id}-fresh`.
    struct SuffixRefresher {
        calls: AtomicUsize,
    }

    impl TokenRefresher for SuffixRefresher {
        fn refresh<'a>(
            &'a self,
            refresh_token: &'a str,
        ) -> BoxFuture<'a, oauth::Result<TokenResponse>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                let id = refresh_token.trim_start_matches("rt-");
                Ok(TokenResponse {
                    access_token: format!("at-{id}-fresh"),
                    expires_in: 3600,
                    ..TokenResponse::default()
                })
            })
        }
    }

    fn chatgpt_account(id: &str) -> Account {
        let mut account = Account::new(id);
        account.auth.method = Some(AuthMethod::ChatGpt);
        account.auth.secret_ref = format!("ref-{id}");
        account.metadata.secret_ref = format!("ref-{id}");
        account
    }

    fn stored_tokens(id: &str) -> String {
        OAuthTokens {
            access_token: format!("at-{id}"),
            refresh_token: format!("rt-{id}"),
            expires_at: start_time().timestamp() + 3600,
            ..OAuthTokens::default()
        }
        .encode()
        .unwrap()
    }

    struct Fixture {
        accounts: Arc<MemoryAccounts>,
        secrets: Arc<MemorySecrets>,
        source: Arc<FakeSource>,
        refresher: Arc<SuffixRefresher>,
        clock: Arc<ManualClock>,
        fetcher: Arc<UsageFetcher>,
    }

    fn fixture(ids: &[&str], source: FakeSource, max_concurrent: usize) -> Fixture {
        let accounts = Arc::new(MemoryAccounts::with(ids.iter().map(|id| chatgpt_account(id))));
        let seeded: HashMap<String, String> = ids
            .iter()
            .map(|id| (format!("ref-{id}"), stored_tokens(id)))
            .collect();
        let pairs: Vec<(&str, &str)> = seeded
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        let secrets = Arc::new(MemorySecrets::with(&pairs));

        let clock = Arc::new(ManualClock::new(start_time()));
        let refresher = Arc::new(SuffixRefresher {
            calls: AtomicUsize::new(0),
        });
        let freshness = Arc::new(TokenFreshness::new(
            secrets.clone(),
            refresher.clone(),
            clock.clone(),
        ));
        let records = Arc::new(AccountRecords::new(accounts.clone()));
        let source = Arc::new(source);
        let fetcher = Arc::new(
            UsageFetcher::new(
                accounts.clone(),
                records,
                freshness,
                source.clone(),
                clock.clone(),
            )
            .with_max_concurrent(max_concurrent),
        );
        Fixture {
            accounts,
            secrets,
            source,
            refresher,
            clock,
            fetcher,
        }
    }

    #[tokio::test]
    async fn fetch_records_weekly_snapshot_and_plan() {
        let f = fixture(&["a"], FakeSource::accepting(&["at-a"]), 5);

        let outcome = f
            .fetcher
            .fetch_one("a", false, &CancellationToken::new())
            .await
            .unwrap();
        let FetchOutcome::Fetched(account) = outcome else {
            panic!("expected a fetch");
        };
        assert_eq!(account.limits.weekly_percent(), 25.0);
        assert_eq!(account.metadata.plan_type, "plus");
        assert!(account.subscription.is_none(), "subscription failure is not fatal");
        assert_eq!(f.accounts.get("a").unwrap(), account);
    }

    #[tokio::test]
    async fn fresh_snapshot_is_skipped_unless_forced() {
        let f = fixture(&["a"], FakeSource::accepting(&["at-a"]), 5);
        let cancel = CancellationToken::new();
        f.fetcher.fetch_one("a", false, &cancel).await.unwrap();

        f.clock.advance(Duration::minutes(2));
        let outcome = f.fetcher.fetch_one("a", false, &cancel).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Skipped(_)));

        let outcome = f.fetcher.fetch_one("a", true, &cancel).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));

        f.clock.advance(Duration::minutes(6));
        let outcome = f.fetcher.fetch_one("a", false, &cancel).await.unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
    }

    #[tokio::test]
    async fn rejected_token_escalates_to_one_forced_refresh() {
        let f = fixture(&["a"], FakeSource::accepting(&["at-a-fresh"]), 5);

        let outcome = f
            .fetcher
            .fetch_one("a", false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FetchOutcome::Fetched(_)));
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 1);
        let stored = OAuthTokens::decode(&f.secrets.value("ref-a").unwrap()).unwrap();
        assert_eq!(stored.access_token, "at-a-fresh");
    }

    #[tokio::test]
    async fn second_rejection_requires_login() {
        let f = fixture(&["a"], FakeSource::accepting(&[]), 5);

        let err = f
            .fetcher
            .fetch_one("a", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_reauth_required(), "got: {err}");
        assert_eq!(f.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn api_key_accounts_have_no_usage() {
        let f = fixture(&["a"], FakeSource::accepting(&["at-a"]), 5);
        let mut api = Account::new("api");
        api.auth.method = Some(AuthMethod::ApiKey);
        f.accounts.save(&api).await.unwrap();

        let err = f
            .fetcher
            .fetch_one("api", false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Usage(_)));

        // A full batch only considers ChatGPT accounts.
        let report = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched.len(), 1);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn batch_isolates_failures() {
        let mut source = FakeSource::accepting(&["at-a", "at-b", "at-c"]);
        source.failing.insert("at-b".into());
        let f = fixture(&["a", "b", "c"], source, 2);

        let report = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap();
        let fetched: Vec<&str> = report.fetched.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(fetched, vec!["a", "c"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "b");
    }

    #[tokio::test]
    async fn batch_respects_concurrency_cap() {
        let ids = ["a", "b", "c", "d", "e", "f", "g", "h"];
        let tokens: Vec<String> = ids.iter().map(|id| format!("at-{id}")).collect();
        let token_refs: Vec<&str> = tokens.iter().map(String::as_str).collect();
        let mut source = FakeSource::accepting(&token_refs);
        source.delay = std::time::Duration::from_millis(20);
        let f = fixture(&ids, source, 2);

        let report = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched.len(), ids.len());
        assert_eq!(f.source.calls.load(Ordering::SeqCst), ids.len());
        assert!(f.source.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn cancelled_batch_reports_every_account() {
        let f = fixture(&["a", "b"], FakeSource::accepting(&["at-a", "at-b"]), 5);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = f
            .fetcher
            .fetch_all(None, false, &cancel)
            .await
            .unwrap_err();
        let Error::BatchFailed { failures } = err else {
            panic!("expected BatchFailed, got {err}");
        };
        assert_eq!(failures.len(), 2);
        assert!(failures.iter().all(|(_, e)| e.is_cancelled()));
    }

    #[tokio::test]
    async fn single_account_batch_returns_its_own_error() {
        let f = fixture(&["a"], FakeSource::accepting(&[]), 5);
        let err = f
            .fetcher
            .fetch_all(Some(vec!["a".into()]), false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_reauth_required(), "got: {err}");
    }

    #[tokio::test]
    async fn skipped_accounts_count_as_success() {
        let f = fixture(&["a"], FakeSource::accepting(&["at-a"]), 5);
        let mut account = f.accounts.get("a").unwrap();
        account.limits.set(
            LimitKind::Weekly,
            LimitSnapshot {
                percent: 10.0,
                resets_at: start_time(),
                captured_at: start_time(),
            },
        );
        f.accounts.save(&account).await.unwrap();

        let report = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.skipped.len(), 1);
        assert!(report.fetched.is_empty());
    }

    #[tokio::test]
    async fn panicked_fetch_is_reported_as_failure() {
        let mut source = FakeSource::accepting(&["at-a", "at-b"]);
        source.panicking.insert("at-b".into());
        let f = fixture(&["a", "b"], source, 2);

        let report = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.fetched.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "b");
        assert!(matches!(report.failures[0].1, Error::Task(_)));
    }

    #[tokio::test]
    async fn batch_of_panics_fails() {
        let mut source = FakeSource::accepting(&["at-a"]);
        source.panicking.insert("at-a".into());
        let f = fixture(&["a"], source, 2);

        let err = f
            .fetcher
            .fetch_all(None, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Task(_)), "got: {err}");
    }
}
