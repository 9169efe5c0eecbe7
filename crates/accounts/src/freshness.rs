//! Access-token freshness for OAuth accounts.
//!
//! At most one refresh per secret reference is in flight in this process.
//! Every caller takes the reference's lock, reloads the stored tokens and
//! only then decides whether to refresh, so callers queued behind a refresh
//! see its result instead of refreshing again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Duration;
use domain::{Account, BoxFuture, Clock, SecretStore};
use oauth::{OAuthTokens, TokenEndpoint, TokenResponse};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::metrics;

pub const DEFAULT_REFRESH_SKEW: Duration = Duration::minutes(2);

/// Trades a refresh token for new tokens.
pub trait TokenRefresher: Send + Sync {
    fn refresh<'a>(&'a self, refresh_token: &'a str)
    -> BoxFuture<'a, oauth::Result<TokenResponse>>;
}

impl TokenRefresher for TokenEndpoint {
    fn refresh<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, oauth::Result<TokenResponse>> {
        Box::pin(TokenEndpoint::refresh(self, refresh_token))
    }
}

/// Secret reference holding an account's OAuth tokens.
pub fn tokens_ref(account: &Account) -> String {
    let auth_ref = account.auth.secret_ref.trim();
    if auth_ref.is_empty() {
        secrets::oauth_tokens_key(&account.id)
    } else {
        auth_ref.to_owned()
    }
}

pub struct TokenFreshness {
    secrets: Arc<dyn SecretStore>,
    refresher: Arc<dyn TokenRefresher>,
    clock: Arc<dyn Clock>,
    skew: Duration,
    // Entries are created on first use and never removed.
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenFreshness {
    pub fn new(
        secrets: Arc<dyn SecretStore>,
        refresher: Arc<dyn TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secrets,
            refresher,
            clock,
            skew: DEFAULT_REFRESH_SKEW,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_skew(mut self, skew: Duration) -> Self {
        self.skew = skew;
        self
    }

    fn lock_for(&self, secret_ref: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(secret_ref.to_owned()).or_default().clone()
    }

    /// Return usable tokens for `account`, refreshing when needed.
    ///
    /// `force` is for callers that just saw `cached` rejected by the
    /// provider: the refresh happens unless someone already replaced the
    /// stored access token.
    pub async fn ensure_fresh_tokens(
        &self,
        account: &Account,
        cached: Option<&OAuthTokens>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<OAuthTokens> {
        let account_id = account.id.as_str();
        let secret_ref = tokens_ref(account);
        let lock = self.lock_for(&secret_ref);
        let _guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = lock.lock() => guard,
        };

        let stored = self.load(account_id, &secret_ref).await?;

        if !force && !stored.expiring_soon(self.clock.now(), self.skew) {
            return Ok(stored);
        }
        if force {
            if let Some(cached) = cached {
                if !cached.access_token.is_empty() && cached.access_token != stored.access_token
                {
                    debug!(account_id, "token already refreshed by another caller");
                    metrics::record_refresh("reused");
                    return Ok(stored);
                }
            }
        }
        if stored.refresh_token.is_empty() {
            warn!(account_id, "no refresh token stored");
            return Err(Error::ReauthRequired {
                account_id: account_id.to_owned(),
            });
        }

        debug!(account_id, force, "refreshing access token");
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            response = self.refresher.refresh(&stored.refresh_token) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(e) if e.is_invalid_grant() => {
                warn!(account_id, error = %e, "refresh token rejected");
                metrics::record_refresh("invalid_grant");
                return Err(Error::ReauthRequired {
                    account_id: account_id.to_owned(),
                });
            }
            Err(e) => {
                warn!(account_id, error = %e, "token refresh failed");
                metrics::record_refresh("error");
                return Err(e.into());
            }
        };

        let next = stored.refreshed(response, self.clock.now());
        self.secrets.put(&secret_ref, &next.encode()?).await?;
        metrics::record_refresh("refreshed");
        info!(account_id, expires_at = next.expires_at, "access token refreshed");
        Ok(next)
    }

    async fn load(&self, account_id: &str, secret_ref: &str) -> Result<OAuthTokens> {
        match self.secrets.get(secret_ref).await {
            Ok(raw) => Ok(OAuthTokens::decode(&raw)?),
            Err(e) if e.is_not_found() => Err(Error::ReauthRequired {
                account_id: account_id.to_owned(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MemorySecrets, start_time};
    use domain::{AuthMethod, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRefresher {
        calls: AtomicUsize,
        outcome: fn(usize) -> oauth::Result<TokenResponse>,
        delay: std::time::Duration,
    }

    impl FakeRefresher {
        fn new(outcome: fn(usize) -> oauth::Result<TokenResponse>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: std::time::Duration::ZERO,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenRefresher for FakeRefresher {
        fn refresh<'a>(
            &'a self,
            _refresh_token: &'a str,
        ) -> BoxFuture<'a, oauth::Result<TokenResponse>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(self.delay).await;
                (self.outcome)(n)
            })
        }
    }

    fn rotated(n: usize) -> oauth::Result<TokenResponse> {
        Ok(TokenResponse {
            access_token: format!("at-{n}"),
            expires_in: 3600,
            ..TokenResponse::default()
        })
    }

    fn account() -> Account {
        let mut account = Account::new("acc-1");
        account.auth.method = Some(AuthMethod::ChatGpt);
        account.auth.secret_ref = "ref-1".into();
        account
    }

    fn stored(access: &str, refresh: &str, expires_at: i64) -> String {
        OAuthTokens {
            access_token: access.into(),
            refresh_token: refresh.into(),
            id_token: "id-old".into(),
            expires_in: 3600,
            expires_at,
            ..OAuthTokens::default()
        }
        .encode()
        .unwrap()
    }

    fn secrets_with(tokens: String) -> Arc<MemorySecrets> {
        Arc::new(MemorySecrets::with(&[("ref-1", tokens.as_str())]))
    }

    fn manager(secrets: &Arc<MemorySecrets>, refresher: &Arc<FakeRefresher>) -> TokenFreshness {
        TokenFreshness::new(
            secrets.clone(),
            refresher.clone(),
            Arc::new(ManualClock::new(start_time())),
        )
    }

    fn now_secs() -> i64 {
        start_time().timestamp()
    }

    #[tokio::test]
    async fn fresh_token_is_returned_without_refresh() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() + 3600));
        let refresher = FakeRefresher::new(rotated);

        let tokens = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-0");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_and_persisted() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() + 60));
        let refresher = FakeRefresher::new(rotated);

        let tokens = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(tokens.refresh_token, "rt", "omitted refresh token carries over");
        assert_eq!(tokens.id_token, "id-old");
        assert_eq!(tokens.expires_at, now_secs() + 3600);
        let persisted = OAuthTokens::decode(&secrets.value("ref-1").unwrap()).unwrap();
        assert_eq!(persisted, tokens);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() - 10));
        let refresher = Arc::new(FakeRefresher {
            calls: AtomicUsize::new(0),
            outcome: rotated,
            delay: std::time::Duration::from_millis(20),
        });
        let manager = Arc::new(manager(&secrets, &refresher));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.spawn(async move {
                manager
                    .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
                    .await
            });
        }
        while let Some(result) = tasks.join_next().await {
            assert_eq!(result.unwrap().unwrap().access_token, "at-1");
        }
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn forced_refresh_reuses_token_refreshed_elsewhere() {
        let secrets = secrets_with(stored("at-new", "rt", now_secs() + 3600));
        let refresher = FakeRefresher::new(rotated);
        let stale = OAuthTokens {
            access_token: "at-old".into(),
            ..OAuthTokens::default()
        };

        let tokens = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), Some(&stale), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-new");
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn forced_refresh_replaces_rejected_token() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() + 3600));
        let refresher = FakeRefresher::new(rotated);
        let rejected = OAuthTokens {
            access_token: "at-0".into(),
            ..OAuthTokens::default()
        };

        let tokens = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), Some(&rejected), true, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tokens.access_token, "at-1");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn invalid_grant_requires_new_login() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() - 1));
        let refresher =
            FakeRefresher::new(|_| Err(oauth::Error::InvalidGrant("revoked".into())));

        let err = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(err.is_reauth_required(), "got: {err}");
        assert!(err.to_string().contains("oa login browser --account acc-1"));
    }

    #[tokio::test]
    async fn transient_refresh_failure_is_not_reauth() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() - 1));
        let refresher = FakeRefresher::new(|_| Err(oauth::Error::Http("connection reset".into())));

        let err = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::OAuth(oauth::Error::Http(_))), "got: {err}");
        assert_eq!(
            OAuthTokens::decode(&secrets.value("ref-1").unwrap())
                .unwrap()
                .access_token,
            "at-0"
        );
    }

    #[tokio::test]
    async fn missing_tokens_or_refresh_token_require_login() {
        let refresher = FakeRefresher::new(rotated);

        let empty = Arc::new(MemorySecrets::default());
        let err = manager(&empty, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_reauth_required());

        let no_refresh = secrets_with(stored("at-0", "", now_secs() - 1));
        let err = manager(&no_refresh, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_reauth_required());
        assert_eq!(refresher.calls(), 0);
    }

    #[tokio::test]
    async fn cancelled_caller_stops_before_refreshing() {
        let secrets = secrets_with(stored("at-0", "rt", now_secs() - 1));
        let refresher = FakeRefresher::new(rotated);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = manager(&secrets, &refresher)
            .ensure_fresh_tokens(&account(), None, false, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(refresher.calls(), 0);
    }

    #[test]
    fn tokens_ref_falls_back_to_conventional_key() {
        assert_eq!(tokens_ref(&account()), "ref-1");
        assert_eq!(
            tokens_ref(&Account::new("acc-2")),
            "openai://acc-2/oauth_tokens"
        );
    }
}
