//! Request plumbing shared by the token, device and usage calls:
//! endpoint validation, bounded body reads, OAuth error bodies.

use reqwest::Url;
use serde::Deserialize;

use crate::constants::MAX_RESPONSE_BYTES;
use crate::error::{Error, Result};

/// Parse `raw` as an absolute http(s) URL with a host.
pub fn http_url(raw: &str, what: &str) -> Result<Url> {
    if raw.trim().is_empty() {
        return Err(Error::InvalidRequest(format!("{what} is required")));
    }
    let url = Url::parse(raw.trim())
        .map_err(|e| Error::InvalidRequest(format!("parse {what}: {e}")))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(Error::InvalidRequest(format!("{what} must use http or https")));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(Error::InvalidRequest(format!("{what} host is required")));
    }
    Ok(url)
}

/// `base` with `path` appended, e.g. issuer + `/oauth/token`.
pub fn endpoint(base: &str, path: &str) -> Result<Url> {
    if path.is_empty() {
        return Err(Error::InvalidRequest("api path is required".into()));
    }
    http_url(base, "api base url")?;
    http_url(&format!("{}{path}", base.trim().trim_end_matches('/')), "api endpoint")
}

pub fn transport_error(context: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{context}: {e}"))
    } else {
        Error::Http(format!("{context}: {e}"))
    }
}

/// Read the whole body, refusing anything over [`MAX_RESPONSE_BYTES`].
pub async fn read_limited(mut response: reqwest::Response, context: &str) -> Result<Vec<u8>> {
    let mut body = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| transport_error(context, e))?
    {
        if body.len() + chunk.len() > MAX_RESPONSE_BYTES {
            return Err(Error::MalformedResponse(format!(
                "{context}: response body exceeds {MAX_RESPONSE_BYTES} bytes"
            )));
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// RFC 6749 section 5.2 error body.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct OAuthErrorBody {
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub error_description: String,
    /// Device flow only: the interval the server wants from now on.
    #[serde(default)]
    pub interval: i64,
}

impl OAuthErrorBody {
    pub(crate) fn parse(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body).ok()
    }

    pub(crate) fn describe(&self, status: u16) -> String {
        match (self.error.is_empty(), self.error_description.is_empty()) {
            (true, _) => format!("status {status}"),
            (false, true) => self.error.clone(),
            (false, false) => format!("{}: {}", self.error, self.error_description),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_url_fails_closed() {
        assert!(http_url("https://auth.openai.com", "issuer").is_ok());
        assert!(http_url("", "issuer").is_err());
        assert!(http_url("ftp://auth.openai.com", "issuer").is_err());
        assert!(http_url("file:///etc/passwd", "issuer").is_err());
        assert!(http_url("not a url", "issuer").is_err());
    }

    #[test]
    fn endpoint_appends_path() {
        let url = endpoint("https://auth.openai.com/", "/oauth/token").unwrap();
        assert_eq!(url.as_str(), "https://auth.openai.com/oauth/token");
        let url = endpoint("https://chatgpt.com/backend-api", "/wham/usage").unwrap();
        assert_eq!(url.as_str(), "https://chatgpt.com/backend-api/wham/usage");
    }

    #[test]
    fn error_body_description() {
        let body = OAuthErrorBody::parse(
            br#"{"error":"invalid_grant","error_description":"refresh token expired"}"#,
        )
        .unwrap();
        assert_eq!(body.describe(400), "invalid_grant: refresh token expired");
        assert_eq!(OAuthErrorBody::default().describe(502), "status 502");
        assert!(OAuthErrorBody::parse(b"<html>").is_none());
    }
}
