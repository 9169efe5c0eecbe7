//! OpenAI OAuth client configuration
//!
//! Public client values matching the Codex CLI. None of these are secrets.

use std::time::Duration;

pub const DEFAULT_ISSUER: &str = "https://auth.openai.com";

/// Public OAuth client id shared with the Codex CLI
pub const DEFAULT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

pub const AUTHORIZE_PATH: &str = "/oauth/authorize";
pub const TOKEN_PATH: &str = "/oauth/token";
pub const DEVICE_CODE_PATH: &str = "/oauth/device/code";

pub const SCOPES: &[&str] = &["openid", "profile", "email", "offline_access"];

/// Reported to the authorization server as the initiating client
pub const DEFAULT_ORIGINATOR: &str = "oa";

pub const CALLBACK_PATH: &str = "/auth/callback";
pub const DEFAULT_CALLBACK_ADDR: &str = "127.0.0.1:1455";

pub const DEVICE_CODE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Upper bound on any OAuth response body
pub const MAX_RESPONSE_BYTES: usize = 1 << 20;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_LOGIN_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Added to the device poll interval on each `slow_down`
pub const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);
