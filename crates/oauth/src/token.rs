//! OAuth token endpoint: authorization code exchange and refresh
//!
//! Both POST `application/x-www-form-urlencoded` bodies to
//! `{issuer}/oauth/token`. Non-2xx responses are parsed as OAuth error
//! bodies; `invalid_grant` on refresh maps to [`Error::InvalidGrant`].

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::{DEFAULT_REQUEST_TIMEOUT, TOKEN_PATH};
use crate::error::{Error, Result};
use crate::http::{OAuthErrorBody, endpoint, read_limited, transport_error};

/// Token endpoint response for exchange, refresh and device polling.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    #[serde(default)]
    pub id_token: String,
    #[serde(default)]
    pub token_type: String,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default)]
    pub expires_in: i64,
    #[serde(default)]
    pub scope: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Grant {
    AuthorizationCode,
    RefreshToken,
}

impl Grant {
    fn as_str(self) -> &'static str {
        match self {
            Grant::AuthorizationCode => "authorization code exchange",
            Grant::RefreshToken => "token refresh",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TokenEndpoint {
    http: reqwest::Client,
    url: Url,
    client_id: String,
    request_timeout: Duration,
}

impl TokenEndpoint {
    pub fn new(http: reqwest::Client, issuer: &str, client_id: impl Into<String>) -> Result<Self> {
        let client_id = client_id.into();
        if client_id.trim().is_empty() {
            return Err(Error::InvalidRequest("client id is required".into()));
        }
        Ok(Self {
            http,
            url: endpoint(issuer, TOKEN_PATH)?,
            client_id,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    /// Per-request bound, applied in addition to any deadline the caller
    /// imposes by dropping the future.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Exchange an authorization code for tokens. The response must carry
    /// access, refresh and id tokens.
    pub async fn exchange_code(
        &self,
        code: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<TokenResponse> {
        for (value, name) in [
            (code, "authorization code"),
            (redirect_uri, "redirect uri"),
            (code_verifier, "code verifier"),
        ] {
            if value.is_empty() {
                return Err(Error::InvalidRequest(format!("{name} is required")));
            }
        }

        let tokens = self
            .post(
                Grant::AuthorizationCode,
                &[
                    ("grant_type", "authorization_code"),
                    ("code", code),
                    ("redirect_uri", redirect_uri),
                    ("client_id", &self.client_id),
                    ("code_verifier", code_verifier),
                ],
            )
            .await?;

        if tokens.refresh_token.is_empty() || tokens.id_token.is_empty() {
            return Err(Error::MalformedResponse(
                "token response missing refresh or id token".into(),
            ));
        }
        Ok(tokens)
    }

    /// Trade a refresh token for a new access token. Providers may omit the
    /// refresh and id tokens from the response.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        if refresh_token.is_empty() {
            return Err(Error::InvalidRequest("refresh token is required".into()));
        }
        self.post(
            Grant::RefreshToken,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.client_id),
            ],
        )
        .await
    }

    async fn post(&self, grant: Grant, form: &[(&str, &str)]) -> Result<TokenResponse> {
        let context = grant.as_str();
        let response = self
            .http
            .post(self.url.clone())
            .timeout(self.request_timeout)
            .form(form)
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;

        let status = response.status();
        let body = read_limited(response, context).await?;

        if !status.is_success() {
            let oauth = OAuthErrorBody::parse(&body).unwrap_or_default();
            let message = oauth.describe(status.as_u16());
            if oauth.error == "invalid_grant" {
                return Err(Error::InvalidGrant(message));
            }
            // A refresh rejected outright means the refresh token is revoked.
            if grant == Grant::RefreshToken && matches!(status.as_u16(), 401 | 403) {
                return Err(Error::InvalidGrant(message));
            }
            return Err(Error::TokenEndpoint {
                status: status.as_u16(),
                message,
            });
        }

        let tokens: TokenResponse = serde_json::from_slice(&body)
            .map_err(|e| Error::MalformedResponse(format!("{context}: invalid JSON: {e}")))?;
        if tokens.access_token.is_empty() {
            return Err(Error::MalformedResponse(format!(
                "{context}: response missing access token"
            )));
        }
        debug!(grant = context, expires_in = tokens.expires_in, "token endpoint succeeded");
        Ok(tokens)
    }
}
