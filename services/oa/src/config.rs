//! Configuration types and loading
//!
//! Precedence: environment variables > config file > defaults. The file is
//! optional when it is the default `~/.codex/oa.toml`; a path given with
//! `--config` or `OA_CONFIG` must exist. Secrets never live here.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "oa.toml";
const CODEX_DIR: &str = ".codex";
/// Upper bound for every `*_secs` setting (one year).
const MAX_DURATION_SECS: u64 = 365 * 24 * 60 * 60;

/// Root configuration, fully resolved.
#[derive(Debug, Clone)]
pub struct Config {
    pub paths: PathsConfig,
    pub auth: AuthConfig,
    pub usage: UsageConfig,
    pub refresh: RefreshConfig,
}

/// Where records and file-backed secrets live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathsConfig {
    pub accounts: PathBuf,
    pub pools: PathBuf,
    pub runtime: PathBuf,
    pub secrets_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub issuer: String,
    pub client_id: String,
    pub callback_addr: String,
    pub login_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub base_url: String,
    pub max_concurrent: usize,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub skew_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: oauth::DEFAULT_ISSUER.to_owned(),
            client_id: oauth::DEFAULT_CLIENT_ID.to_owned(),
            callback_addr: oauth::DEFAULT_CALLBACK_ADDR.to_owned(),
            login_timeout_secs: oauth::DEFAULT_LOGIN_TIMEOUT.as_secs(),
            request_timeout_secs: oauth::DEFAULT_REQUEST_TIMEOUT.as_secs(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            base_url: accounts::usage::DEFAULT_USAGE_BASE_URL.to_owned(),
            max_concurrent: accounts::fetch::DEFAULT_MAX_CONCURRENT,
            cache_ttl_secs: 300,
        }
    }
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self { skew_secs: 120 }
    }
}

impl AuthConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl UsageConfig {
    pub fn cache_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.cache_ttl_secs)
    }
}

impl RefreshConfig {
    pub fn skew(&self) -> chrono::Duration {
        bounded_seconds(self.skew_secs)
    }
}

fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

/// The file as written; unset paths fall back to `~/.codex`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    paths: FilePaths,
    auth: AuthConfig,
    usage: UsageConfig,
    refresh: RefreshConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FilePaths {
    accounts: Option<PathBuf>,
    pools: Option<PathBuf>,
    runtime: Option<PathBuf>,
    secrets_dir: Option<PathBuf>,
}

fn env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
}

fn codex_dir() -> common::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(CODEX_DIR))
        .ok_or(common::Error::NoHome("OA_CONFIG"))
}

/// Expand a leading `~/` against the home directory.
fn expand_home(path: PathBuf) -> common::Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => Ok(dirs::home_dir()
            .ok_or(common::Error::NoHome("OA_CONFIG"))?
            .join(rest)),
        Err(_) => Ok(path),
    }
}

fn require_http(value: &str, key: &str) -> common::Result<()> {
    if !value.starts_with("http://") && !value.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{key} must start with http:// or https://, got: {value}"
        )));
    }
    Ok(())
}

fn require_nonzero(value: u64, key: &str) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!("{key} must be greater than 0")));
    }
    Ok(())
}

fn require_duration(value: u64, key: &str) -> common::Result<()> {
    require_nonzero(value, key)?;
    if value > MAX_DURATION_SECS {
        return Err(common::Error::Config(format!(
            "{key} must be at most {MAX_DURATION_SECS}, got: {value}"
        )));
    }
    Ok(())
}

impl Config {
    /// Resolve the config file path from the CLI flag, then `OA_CONFIG`.
    /// Returns the path and whether it was chosen explicitly.
    pub fn resolve_path(cli_path: Option<&Path>) -> common::Result<(PathBuf, bool)> {
        if let Some(p) = cli_path {
            return Ok((p.to_path_buf(), true));
        }
        if let Some(p) = env("OA_CONFIG") {
            return Ok((PathBuf::from(p), true));
        }
        Ok((codex_dir()?.join(DEFAULT_CONFIG_FILE), false))
    }

    pub fn load(cli_path: Option<&Path>) -> common::Result<Self> {
        let (path, explicit) = Self::resolve_path(cli_path)?;
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !explicit => {
                FileConfig::default()
            }
            Err(e) => {
                return Err(common::Error::Config(format!(
                    "failed to read {}: {e}",
                    path.display()
                )));
            }
        };
        Self::resolve(file)
    }

    /// Parse a TOML document and resolve it as if loaded from disk.
    pub fn from_toml(contents: &str) -> common::Result<Self> {
        Self::resolve(toml::from_str(contents)?)
    }

    fn resolve(file: FileConfig) -> common::Result<Self> {
        let FileConfig {
            paths,
            mut auth,
            mut usage,
            refresh,
        } = file;

        let path_or_default = |path: Option<PathBuf>, name: &str| -> common::Result<PathBuf> {
            match path {
                Some(p) => expand_home(p),
                None => Ok(codex_dir()?.join(name)),
            }
        };
        let accounts_path = match env("OA_ACCOUNTS_PATH") {
            Some(p) => expand_home(PathBuf::from(p))?,
            None => path_or_default(paths.accounts, "accounts.toml")?,
        };
        let paths = PathsConfig {
            accounts: accounts_path,
            pools: path_or_default(paths.pools, "pools.toml")?,
            runtime: path_or_default(paths.runtime, "pool_runtime.toml")?,
            secrets_dir: path_or_default(paths.secrets_dir, "secrets")?,
        };

        if let Some(issuer) = env("OA_AUTH_ISSUER") {
            auth.issuer = issuer;
        }
        if let Some(client_id) = env("OA_AUTH_CLIENT_ID") {
            auth.client_id = client_id;
        }
        if let Some(addr) = env("OA_AUTH_LISTEN") {
            auth.callback_addr = addr;
        }
        if let Some(base_url) = env("OA_USAGE_BASE_URL") {
            usage.base_url = base_url;
        }

        require_http(&auth.issuer, "auth.issuer")?;
        require_http(&usage.base_url, "usage.base_url")?;
        if auth.client_id.trim().is_empty() {
            return Err(common::Error::Config("auth.client_id must not be empty".into()));
        }
        if auth.callback_addr.trim().is_empty() {
            return Err(common::Error::Config(
                "auth.callback_addr must not be empty".into(),
            ));
        }
        require_duration(auth.login_timeout_secs, "auth.login_timeout_secs")?;
        require_duration(auth.request_timeout_secs, "auth.request_timeout_secs")?;
        require_nonzero(usage.max_concurrent as u64, "usage.max_concurrent")?;
        require_duration(usage.cache_ttl_secs, "usage.cache_ttl_secs")?;
        require_duration(refresh.skew_secs, "refresh.skew_secs")?;

        Ok(Self {
            paths,
            auth,
            usage,
            refresh,
        })
    }
}
