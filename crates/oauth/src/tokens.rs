//! The token record kept in the secret store for OAuth-authenticated
//! accounts, serialized as JSON with empty fields omitted.
//!
//! `expires_at` is an absolute unix timestamp in seconds, computed from the
//! server-reported `expires_in` at the moment the response was received.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::claims::TokenClaims;
use crate::error::{Error, Result};
use crate::token::TokenResponse;

fn is_zero(n: &i64) -> bool {
    *n == 0
}

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub refresh_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id_token: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub expires_at: i64,
}

impl fmt::Debug for OAuthTokens {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuthTokens")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("id_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_in", &self.expires_in)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl OAuthTokens {
    /// Tokens from a fresh token endpoint response received at `now`.
    pub fn from_response(resp: TokenResponse, now: DateTime<Utc>) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
            id_token: resp.id_token,
            token_type: resp.token_type,
            expires_in: resp.expires_in,
            expires_at: 0,
        }
        .with_calculated_expiry(now)
    }

    /// Tokens after a refresh: whatever the response omits (refresh token,
    /// id token, token type) carries over from `self`.
    pub fn refreshed(&self, resp: TokenResponse, now: DateTime<Utc>) -> Self {
        let mut next = Self::from_response(resp, now);
        if next.refresh_token.is_empty() {
            next.refresh_token = self.refresh_token.clone();
        }
        if next.id_token.is_empty() {
            next.id_token = self.id_token.clone();
        }
        if next.token_type.is_empty() {
            next.token_type = self.token_type.clone();
        }
        next
    }

    /// Set `expires_at` from `expires_in`; zero when the server gave no lifetime.
    pub fn with_calculated_expiry(mut self, now: DateTime<Utc>) -> Self {
        self.expires_at = if self.expires_in > 0 {
            now.timestamp().saturating_add(self.expires_in)
        } else {
            0
        };
        self
    }

    /// Whether the access token expires within `skew` of `now`. Unknown
    /// expiry never counts as expiring.
    pub fn expiring_soon(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        if self.expires_at <= 0 {
            return false;
        }
        match now.checked_add_signed(skew) {
            Some(deadline) => self.expires_at <= deadline.timestamp(),
            None => true,
        }
    }

    pub fn claims(&self) -> TokenClaims {
        TokenClaims::parse(&self.id_token).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self> {
        let tokens: Self = serde_json::from_str(raw)
            .map_err(|e| Error::MalformedResponse(format!("decode stored oauth tokens: {e}")))?;
        if tokens.access_token.is_empty() {
            return Err(Error::MalformedResponse(
                "stored oauth tokens have no access token".into(),
            ));
        }
        Ok(tokens)
    }

    pub fn encode(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| Error::MalformedResponse(format!("encode oauth tokens: {e}")))
    }
}
