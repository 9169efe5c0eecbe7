//! Hands the selected account's ChatGPT tokens to opencode, which keeps its
//! own provider credentials in `~/.local/share/opencode/auth.json`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use oauth::OAuthTokens;
use serde::Serialize;
use serde_json::{Map, Value};

const PROGRAM: &str = "opencode";
const PROVIDER_KEY: &str = "openai";

#[derive(Debug, Serialize)]
struct OAuthEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    refresh: &'a str,
    access: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    expires: i64,
    #[serde(rename = "accountId", skip_serializing_if = "Option::is_none")]
    account_id: Option<String>,
}

fn is_zero(n: &i64) -> bool {
    *n == 0
}

/// Whether `program` launches opencode, by file name.
pub fn is_opencode(program: &str) -> bool {
    Path::new(program.trim())
        .file_name()
        .is_some_and(|name| name == PROGRAM)
}

pub fn auth_path() -> Result<PathBuf> {
    let home = dirs::home_dir().context("cannot resolve the home directory for opencode")?;
    Ok(home.join(".local").join("share").join(PROGRAM).join("auth.json"))
}

/// Expiry in unix milliseconds; zero when unknown.
fn expiry_millis(tokens: &OAuthTokens, now: DateTime<Utc>) -> i64 {
    if tokens.expires_at > 0 {
        return tokens.expires_at.saturating_mul(1000);
    }
    if tokens.expires_in > 0 {
        return now
            .timestamp_millis()
            .saturating_add(tokens.expires_in.saturating_mul(1000));
    }
    0
}

async fn read_auth_map(path: &Path) -> Result<Map<String, Value>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("failed to read {}", path.display()));
        }
    };
    match serde_json::from_slice::<Value>(&data)
        .with_context(|| format!("failed to decode {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        _ => bail!("{} is not a JSON object", path.display()),
    }
}

/// Replace the `openai` entry of the auth file at `path`, keeping every
/// other provider untouched.
pub async fn sync_tokens(path: &Path, tokens: &OAuthTokens, now: DateTime<Utc>) -> Result<()> {
    let mut content = read_auth_map(path).await?;
    let entry = OAuthEntry {
        kind: "oauth",
        refresh: &tokens.refresh_token,
        access: &tokens.access_token,
        expires: expiry_millis(tokens, now),
        account_id: tokens.claims().chatgpt_account_id,
    };
    content.insert(PROVIDER_KEY.to_owned(), serde_json::to_value(entry)?);

    let data = serde_json::to_vec_pretty(&Value::Object(content))?;
    common::fs::write_atomic(path, &data)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
