//! Usage and subscription endpoints of the ChatGPT backend.
//!
//! The usage payload reports several rate-limit windows. Windows of six days
//! or longer count as weekly, shorter ones as daily. The narrowest daily and
//! the widest weekly window are kept; windows without a reset time are
//! ignored.

use std::time::Duration;

use chrono::{DateTime, Utc};
use domain::{BoxFuture, LimitSnapshot, Subscription};
use oauth::OAuthTokens;
use oauth::http::{endpoint, read_limited, transport_error};
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::error::{Error, Result};

pub const DEFAULT_USAGE_BASE_URL: &str = "https://chatgpt.com/backend-api";
pub const USAGE_PATH: &str = "/wham/usage";
pub const SUBSCRIPTIONS_PATH: &str = "/subscriptions";
const USER_AGENT: &str = "oa/usage";
const ACCOUNT_ID_HEADER: &str = "ChatGPT-Account-Id";
const WEEKLY_WINDOW_SECS: i64 = 6 * 24 * 60 * 60;

/// One rate-limit window as reported by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowUsage {
    pub used_percent: f64,
    pub window_seconds: i64,
    pub resets_at: DateTime<Utc>,
}

impl WindowUsage {
    pub fn snapshot(&self, captured_at: DateTime<Utc>) -> LimitSnapshot {
        LimitSnapshot {
            percent: self.used_percent,
            resets_at: self.resets_at,
            captured_at,
        }
    }

    fn is_weekly(&self) -> bool {
        self.window_seconds >= WEEKLY_WINDOW_SECS
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageSnapshot {
    pub plan_type: String,
    pub daily: Option<WindowUsage>,
    pub weekly: Option<WindowUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct UsagePayload {
    #[serde(default)]
    plan_type: Option<String>,
    #[serde(default)]
    rate_limit: Option<RateLimit>,
    #[serde(default)]
    additional_rate_limits: Vec<AdditionalRateLimit>,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimit {
    #[serde(default)]
    primary_window: Option<RawWindow>,
    #[serde(default)]
    secondary_window: Option<RawWindow>,
}

#[derive(Debug, Default, Deserialize)]
struct AdditionalRateLimit {
    #[serde(default)]
    rate_limit: Option<RateLimit>,
}

#[derive(Debug, Default, Deserialize)]
struct RawWindow {
    #[serde(default)]
    used_percent: f64,
    #[serde(default)]
    limit_window_seconds: i64,
    #[serde(default)]
    reset_at: i64,
}

impl RawWindow {
    fn parse(&self) -> Option<WindowUsage> {
        if self.reset_at <= 0 {
            return None;
        }
        Some(WindowUsage {
            used_percent: self.used_percent,
            window_seconds: self.limit_window_seconds,
            resets_at: DateTime::from_timestamp(self.reset_at, 0)?,
        })
    }
}

impl UsagePayload {
    fn into_snapshot(self) -> UsageSnapshot {
        let windows: Vec<WindowUsage> = self
            .rate_limit
            .iter()
            .chain(self.additional_rate_limits.iter().filter_map(|a| a.rate_limit.as_ref()))
            .flat_map(|rl| [rl.primary_window.as_ref(), rl.secondary_window.as_ref()])
            .flatten()
            .filter_map(RawWindow::parse)
            .collect();

        let mut snapshot = UsageSnapshot {
            plan_type: self.plan_type.unwrap_or_default().trim().to_owned(),
            ..UsageSnapshot::default()
        };
        for window in windows {
            if window.is_weekly() {
                if snapshot
                    .weekly
                    .as_ref()
                    .is_none_or(|w| window.window_seconds > w.window_seconds)
                {
                    snapshot.weekly = Some(window);
                }
            } else if snapshot
                .daily
                .as_ref()
                .is_none_or(|d| window.window_seconds < d.window_seconds)
            {
                snapshot.daily = Some(window);
            }
        }
        snapshot
    }
}

#[derive(Debug, Default, Deserialize)]
struct SubscriptionPayload {
    #[serde(default)]
    active_start: Option<String>,
    #[serde(default)]
    active_until: Option<String>,
    #[serde(default)]
    will_renew: bool,
    #[serde(default)]
    billing_period: Option<String>,
    #[serde(default)]
    billing_currency: Option<String>,
    #[serde(default)]
    is_delinquent: bool,
}

fn parse_rfc3339(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

impl SubscriptionPayload {
    fn into_subscription(self) -> Subscription {
        Subscription {
            active_start: parse_rfc3339(self.active_start.as_deref()),
            active_until: parse_rfc3339(self.active_until.as_deref()),
            will_renew: self.will_renew,
            billing_period: self.billing_period.unwrap_or_default(),
            billing_currency: self.billing_currency.unwrap_or_default(),
            is_delinquent: self.is_delinquent,
            captured_at: None,
        }
    }
}

/// Where usage and subscription data come from.
pub trait UsageSource: Send + Sync {
    /// Fails with [`Error::SessionExpired`] when the access token is rejected.
    fn fetch_usage<'a>(&'a self, tokens: &'a OAuthTokens) -> BoxFuture<'a, Result<UsageSnapshot>>;

    /// `None` when the tokens carry no ChatGPT account id or the provider
    /// has no subscription on record.
    fn fetch_subscription<'a>(
        &'a self,
        tokens: &'a OAuthTokens,
    ) -> BoxFuture<'a, Result<Option<Subscription>>>;
}

#[derive(Debug, Clone)]
pub struct UsageClient {
    http: reqwest::Client,
    base_url: String,
    request_timeout: Duration,
}

impl UsageClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        endpoint(&base_url, USAGE_PATH)?;
        Ok(Self {
            http,
            base_url,
            request_timeout: oauth::DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    async fn get(
        &self,
        context: &str,
        url: reqwest::Url,
        tokens: &OAuthTokens,
    ) -> Result<(StatusCode, Vec<u8>)> {
        let mut request = self
            .http
            .get(url)
            .timeout(self.request_timeout)
            .bearer_auth(&tokens.access_token)
            .header(reqwest::header::USER_AGENT, USER_AGENT);
        if let Some(account_id) = tokens.claims().chatgpt_account_id {
            request = request.header(ACCOUNT_ID_HEADER, account_id);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Error::Usage(transport_error(context, e).to_string()))?;
        let status = response.status();
        let body = read_limited(response, context)
            .await
            .map_err(|e| Error::Usage(e.to_string()))?;
        if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return Err(Error::SessionExpired(format!(
                "{context} returned {}",
                status.as_u16()
            )));
        }
        Ok((status, body))
    }

    async fn usage(&self, tokens: &OAuthTokens) -> Result<UsageSnapshot> {
        let url = endpoint(&self.base_url, USAGE_PATH)?;
        let (status, body) = self.get("usage request", url, tokens).await?;
        if !status.is_success() {
            return Err(Error::Usage(format!(
                "usage endpoint returned {}",
                status.as_u16()
            )));
        }
        let payload: UsagePayload = serde_json::from_slice(&body)
            .map_err(|e| Error::Usage(format!("decode usage response: {e}")))?;
        let snapshot = payload.into_snapshot();
        debug!(
            plan_type = %snapshot.plan_type,
            daily = snapshot.daily.is_some(),
            weekly = snapshot.weekly.is_some(),
            "usage fetched"
        );
        Ok(snapshot)
    }

    async fn subscription(&self, tokens: &OAuthTokens) -> Result<Option<Subscription>> {
        let Some(account_id) = tokens.claims().chatgpt_account_id else {
            return Ok(None);
        };
        let mut url = endpoint(&self.base_url, SUBSCRIPTIONS_PATH)?;
        url.query_pairs_mut().append_pair("account_id", &account_id);

        let (status, body) = self.get("subscription request", url, tokens).await?;
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Usage(format!(
                "subscription endpoint returned {}",
                status.as_u16()
            )));
        }
        let payload: SubscriptionPayload = serde_json::from_slice(&body)
            .map_err(|e| Error::Usage(format!("decode subscription response: {e}")))?;
        Ok(Some(payload.into_subscription()))
    }
}

impl UsageSource for UsageClient {
    fn fetch_usage<'a>(&'a self, tokens: &'a OAuthTokens) -> BoxFuture<'a, Result<UsageSnapshot>> {
        Box::pin(self.usage(tokens))
    }

    fn fetch_subscription<'a>(
        &'a self,
        tokens: &'a OAuthTokens,
    ) -> BoxFuture<'a, Result<Option<Subscription>>> {
        Box::pin(self.subscription(tokens))
    }
}
