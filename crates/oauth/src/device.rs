//! Device authorization grant (RFC 8628)
//!
//! [`DeviceFlow::request_device_code`] obtains a user code and verification
//! URL; [`DeviceFlow::poll_token`] then polls the token endpoint until the
//! user approves, the server refuses, the wall-clock deadline passes, or the
//! caller cancels.

use std::time::Duration;

use reqwest::Url;
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_LOGIN_TIMEOUT, DEFAULT_POLL_INTERVAL, DEFAULT_REQUEST_TIMEOUT, DEVICE_CODE_GRANT_TYPE,
    DEVICE_CODE_PATH, SLOW_DOWN_STEP, TOKEN_PATH,
};
use crate::error::{Error, Result};
use crate::http::{OAuthErrorBody, endpoint, read_limited, transport_error};
use crate::token::TokenResponse;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCode {
    /// `verification_uri_complete` when offered, else `verification_uri`.
    pub verification_url: String,
    pub user_code: String,
    pub interval: Duration,
    pub device_code: String,
}

#[derive(Debug, Clone)]
pub struct DevicePollRequest {
    pub device_code: String,
    /// Zero means [`DEFAULT_POLL_INTERVAL`].
    pub interval: Duration,
    /// Zero means [`DEFAULT_LOGIN_TIMEOUT`].
    pub timeout: Duration,
}

impl DevicePollRequest {
    pub fn from_code(code: &DeviceCode, timeout: Duration) -> Self {
        Self {
            device_code: code.device_code.clone(),
            interval: code.interval,
            timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
struct DeviceCodeResponse {
    #[serde(default)]
    device_code: String,
    #[serde(default)]
    user_code: String,
    #[serde(default)]
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: String,
    #[serde(default)]
    interval: i64,
}

enum Poll {
    Ready(TokenResponse),
    Pending(Duration),
}

#[derive(Debug, Clone)]
pub struct DeviceFlow {
    http: reqwest::Client,
    device_code_url: Url,
    token_url: Url,
    client_id: String,
    request_timeout: Duration,
    slow_down_step: Duration,
}

impl DeviceFlow {
    pub fn new(http: reqwest::Client, issuer: &str, client_id: impl Into<String>) -> Result<Self> {
        Self::with_paths(http, issuer, DEVICE_CODE_PATH, TOKEN_PATH, client_id)
    }

    pub fn with_paths(
        http: reqwest::Client,
        base_url: &str,
        device_code_path: &str,
        token_path: &str,
        client_id: impl Into<String>,
    ) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(Error::InvalidRequest("client id is required".into()));
        }
        Ok(Self {
            http,
            device_code_url: endpoint(base_url, device_code_path)?,
            token_url: endpoint(base_url, token_path)?,
            client_id,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            slow_down_step: SLOW_DOWN_STEP,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_slow_down_step(mut self, step: Duration) -> Self {
        self.slow_down_step = step;
        self
    }

    pub async fn request_device_code(&self, scopes: &[&str]) -> Result<DeviceCode> {
        let scope = scopes.join(" ");
        let mut form = vec![("client_id", self.client_id.as_str())];
        if !scope.is_empty() {
            form.push(("scope", scope.as_str()));
        }

        let response = self
            .http
            .post(self.device_code_url.clone())
            .timeout(self.request_timeout)
            .form(&form)
            .send()
            .await
            .map_err(|e| transport_error("request device code", e))?;
        let status = response.status();
        let body = read_limited(response, "request device code").await?;

        if !status.is_success() {
            let oauth = OAuthErrorBody::parse(&body).unwrap_or_default();
            return Err(Error::TokenEndpoint {
                status: status.as_u16(),
                message: oauth.describe(status.as_u16()),
            });
        }

        let payload: DeviceCodeResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("decode device code response: {e}")))?;
        let verification_url = if payload.verification_uri_complete.is_empty() {
            payload.verification_uri
        } else {
            payload.verification_uri_complete
        };
        if payload.device_code.is_empty() || payload.user_code.is_empty() || verification_url.is_empty()
        {
            return Err(Error::MalformedResponse(
                "device code response missing required fields".into(),
            ));
        }

        Ok(DeviceCode {
            verification_url,
            user_code: payload.user_code,
            interval: if payload.interval > 0 {
                Duration::from_secs(payload.interval as u64)
            } else {
                DEFAULT_POLL_INTERVAL
            },
            device_code: payload.device_code,
        })
    }

    /// Poll until tokens arrive. `authorization_pending` keeps polling,
    /// `slow_down` lengthens the interval, anything else ends the loop.
    pub async fn poll_token(
        &self,
        req: &DevicePollRequest,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse> {
        if req.device_code.is_empty() {
            return Err(Error::InvalidRequest("device code is required".into()));
        }
        let mut interval = if req.interval.is_zero() {
            DEFAULT_POLL_INTERVAL
        } else {
            req.interval
        };
        let timeout = if req.timeout.is_zero() {
            DEFAULT_LOGIN_TIMEOUT
        } else {
            req.timeout
        };
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::DeviceFlowTimeout);
            }

            let poll = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                poll = self.poll_once(&req.device_code, interval, remaining) => match poll {
                    Err(Error::Timeout(_)) if Instant::now() >= deadline => {
                        return Err(Error::DeviceFlowTimeout);
                    }
                    other => other?,
                },
            };
            match poll {
                Poll::Ready(tokens) => {
                    info!("device authorization approved");
                    return Ok(tokens);
                }
                Poll::Pending(next) => interval = next,
            }

            if Instant::now() + interval > deadline {
                return Err(Error::DeviceFlowTimeout);
            }
            debug!(interval_ms = interval.as_millis() as u64, "device authorization pending");
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn poll_once(&self, device_code: &str, interval: Duration, remaining: Duration) -> Result<Poll> {
        let response = self
            .http
            .post(self.token_url.clone())
            .timeout(self.request_timeout.min(remaining))
            .form(&[
                ("grant_type", DEVICE_CODE_GRANT_TYPE),
                ("client_id", self.client_id.as_str()),
                ("device_code", device_code),
            ])
            .send()
            .await
            .map_err(|e| transport_error("poll device token", e))?;
        let status = response.status();
        let body = read_limited(response, "poll device token").await?;

        if status.is_success() {
            let tokens: TokenResponse = serde_json::from_slice(&body)
                .map_err(|e| Error::MalformedResponse(format!("decode token response: {e}")))?;
            if tokens.access_token.is_empty() {
                return Err(Error::MalformedResponse(
                    "token response missing access token".into(),
                ));
            }
            return Ok(Poll::Ready(tokens));
        }

        let Some(oauth) = OAuthErrorBody::parse(&body) else {
            return Err(Error::TokenEndpoint {
                status: status.as_u16(),
                message: format!("status {}", status.as_u16()),
            });
        };

        let mut next = if oauth.interval > 0 {
            Duration::from_secs(oauth.interval as u64)
        } else {
            interval
        };
        match oauth.error.as_str() {
            "authorization_pending" => Ok(Poll::Pending(next)),
            "slow_down" => {
                next += self.slow_down_step;
                Ok(Poll::Pending(next))
            }
            "access_denied" => Err(Error::AccessDenied(oauth.describe(status.as_u16()))),
            "expired_token" => Err(Error::ExpiredToken(oauth.describe(status.as_u16()))),
            _ => Err(Error::TokenEndpoint {
                status: status.as_u16(),
                message: oauth.describe(status.as_u16()),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Form, Json, Router};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    /// Token endpoint answering with `script[n]` on the n-th poll, repeating
    /// the last entry afterwards.
    async fn scripted_token_server(
        script: Vec<(StatusCode, serde_json::Value)>,
    ) -> (String, Arc<AtomicUsize>) {
        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let script = Arc::new(script);
        let router = Router::new()
            .route(
                "/oauth/device/code",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(form["client_id"], "app_test");
                    Json(serde_json::json!({
                        "device_code": "dev-1",
                        "user_code": "ABCD-EFGH",
                        "verification_uri": "https://auth.openai.com/device",
                        "verification_uri_complete": "https://auth.openai.com/device?code=ABCD-EFGH",
                        "interval": 0
                    }))
                }),
            )
            .route(
                "/oauth/token",
                post(move |Form(form): Form<HashMap<String, String>>| {
                    let counter = counter.clone();
                    let script = script.clone();
                    async move {
                        assert_eq!(form["grant_type"], DEVICE_CODE_GRANT_TYPE);
                        assert_eq!(form["device_code"], "dev-1");
                        let n = counter.fetch_add(1, Ordering::SeqCst);
                        let (status, body) = script[n.min(script.len() - 1)].clone();
                        (status, Json(body))
                    }
                }),
            );
        (serve(router).await, polls)
    }

    fn flow(base: &str) -> DeviceFlow {
        DeviceFlow::new(reqwest::Client::new(), base, "app_test")
            .unwrap()
            .with_slow_down_step(Duration::from_millis(20))
    }

    fn poll_request(timeout: Duration) -> DevicePollRequest {
        DevicePollRequest {
            device_code: "dev-1".into(),
            interval: Duration::from_millis(10),
            timeout,
        }
    }

    fn pending() -> (StatusCode, serde_json::Value) {
        (
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "authorization_pending"}),
        )
    }

    #[tokio::test]
    async fn device_code_prefers_complete_uri_and_defaults_interval() {
        let (base, _) = scripted_token_server(vec![pending()]).await;
        let code = flow(&base).request_device_code(&["openid"]).await.unwrap();
        assert_eq!(
            code.verification_url,
            "https://auth.openai.com/device?code=ABCD-EFGH"
        );
        assert_eq!(code.user_code, "ABCD-EFGH");
        assert_eq!(code.device_code, "dev-1");
        assert_eq!(code.interval, DEFAULT_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn polls_through_pending_and_slow_down() {
        let (base, polls) = scripted_token_server(vec![
            pending(),
            (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"error": "slow_down"}),
            ),
            (
                StatusCode::OK,
                serde_json::json!({"access_token": "at", "refresh_token": "rt", "expires_in": 60}),
            ),
        ])
        .await;

        let tokens = flow(&base)
            .poll_token(&poll_request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(tokens.access_token, "at");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn access_denied_ends_polling() {
        let (base, polls) = scripted_token_server(vec![(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "access_denied", "error_description": "user declined"}),
        )])
        .await;
        let err = flow(&base)
            .poll_token(&poll_request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)), "got: {err}");
        assert_eq!(polls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_code_is_distinct() {
        let (base, _) = scripted_token_server(vec![(
            StatusCode::BAD_REQUEST,
            serde_json::json!({"error": "expired_token"}),
        )])
        .await;
        let err = flow(&base)
            .poll_token(&poll_request(Duration::from_secs(5)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ExpiredToken(_)), "got: {err}");
    }

    #[tokio::test]
    async fn gives_up_at_the_deadline() {
        let (base, _) = scripted_token_server(vec![pending()]).await;
        let err = flow(&base)
            .poll_token(&poll_request(Duration::from_millis(150)), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceFlowTimeout), "got: {err}");
    }

    #[tokio::test]
    async fn cancellation_stops_polling() {
        let (base, _) = scripted_token_server(vec![pending()]).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let err = flow(&base)
            .poll_token(&poll_request(Duration::from_secs(30)), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled), "got: {err}");
    }
}
