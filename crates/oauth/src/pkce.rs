//! PKCE (Proof Key for Code Exchange) per RFC 7636, plus the authorization
//! URL that carries the challenge.
//!
//! The verifier stays local and is sent during code exchange; the S256
//! challenge goes into the authorization URL so the server can tie the
//! exchange to the party that started the flow.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;
use sha2::{Digest, Sha256};

use crate::constants::DEFAULT_ORIGINATOR;
use crate::error::{Error, Result};
use crate::http::http_url;

pub const CHALLENGE_METHOD_S256: &str = "S256";

#[derive(Debug, Clone)]
pub struct PkcePair {
    pub verifier: String,
    pub challenge: String,
}

impl PkcePair {
    pub fn generate() -> Self {
        let verifier = generate_verifier();
        let challenge = compute_challenge(&verifier);
        Self {
            verifier,
            challenge,
        }
    }
}

/// 32 random bytes as URL-safe base64 without padding: 43 characters, the
/// RFC 7636 minimum.
pub fn generate_verifier() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<32>())
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Opaque CSRF token echoed back by the authorization server.
pub fn generate_state() -> String {
    URL_SAFE_NO_PAD.encode(random_bytes::<16>())
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::rng().fill(&mut bytes);
    bytes
}

#[derive(Debug, Clone, Default)]
pub struct AuthorizationRequest {
    pub auth_url: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scopes: Vec<String>,
    pub state: String,
    pub code_challenge: String,
    /// Defaults to [`DEFAULT_ORIGINATOR`] when empty.
    pub originator: String,
}

/// Build the authorization URL. Fails closed on a non-http(s) or host-less
/// URL and on any missing required parameter.
pub fn build_authorization_url(req: &AuthorizationRequest) -> Result<String> {
    for (value, name) in [
        (&req.auth_url, "auth url"),
        (&req.client_id, "client id"),
        (&req.redirect_uri, "redirect uri"),
        (&req.state, "state"),
        (&req.code_challenge, "code challenge"),
    ] {
        if value.trim().is_empty() {
            return Err(Error::InvalidRequest(format!("{name} is required")));
        }
    }

    let mut url = http_url(&req.auth_url, "auth url")?;
    let originator = if req.originator.is_empty() {
        DEFAULT_ORIGINATOR
    } else {
        req.originator.as_str()
    };

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("response_type", "code")
            .append_pair("client_id", &req.client_id)
            .append_pair("redirect_uri", &req.redirect_uri);
        if !req.scopes.is_empty() {
            query.append_pair("scope", &req.scopes.join(" "));
        }
        query
            .append_pair("state", &req.state)
            .append_pair("code_challenge", &req.code_challenge)
            .append_pair("code_challenge_method", CHALLENGE_METHOD_S256)
            .append_pair("id_token_add_organizations", "true")
            .append_pair("codex_cli_simplified_flow", "true")
            .append_pair("originator", originator);
    }

    Ok(url.into())
}
