//! Wiring of repositories, secret stores and services, plus the command
//! handlers. Handlers print plain lines to stdout; logs go to stderr.

use std::path::Path;
use std::sync::Arc;

use accounts::{
    AccountRecords, AccountStatus, CredentialLifecycle, PoolService, SessionService,
    TokenFreshness, UsageClient, UsageFetcher, resolve_logical_session_id,
};
use anyhow::{Context, Result, bail};
use chrono::Utc;
use common::SecretString;
use domain::{
    Account, AccountRepository, AuthMethod, Clock, MemoryPacket, SecretStore, SystemClock,
    compact_number,
};
use oauth::{
    AuthorizationRequest, CallbackServer, DeviceFlow, DevicePollRequest, OAuthTokens, PkcePair,
    TokenEndpoint, TokenResponse, build_authorization_url, generate_state,
};
use repo::{TomlAccountRepository, TomlPoolRepository, TomlPoolRuntimeRepository};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cli::{
    AccountsCommand, AuthCommand, Command, LoginCommand, PoolArgs, PoolCommand, RunArgs,
    SessionCommand, UsageCommand, WindowArgs,
};
use crate::config::Config;
use crate::opencode;

const SECRET_ENV: &str = "OA_SECRET";
const WINDOW_ENV: [&str; 3] = ["OA_WINDOW_FINGERPRINT", "TERM_SESSION_ID", "TMUX_PANE"];

/// What `oa run` selected for the child process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub pool_id: String,
    pub account_id: String,
    pub logical_session_id: String,
    pub provider_session_id: String,
}

impl RunContext {
    pub fn env(&self) -> [(&'static str, &str); 4] {
        [
            ("OA_POOL_ID", self.pool_id.as_str()),
            ("OA_ACTIVE_ACCOUNT", self.account_id.as_str()),
            ("OA_LOGICAL_SESSION_ID", self.logical_session_id.as_str()),
            ("OA_PROVIDER_SESSION_ID", self.provider_session_id.as_str()),
        ]
    }
}

pub struct App {
    config: Config,
    clock: Arc<dyn Clock>,
    accounts: Arc<dyn AccountRepository>,
    freshness: Arc<TokenFreshness>,
    lifecycle: CredentialLifecycle,
    records: Arc<AccountRecords>,
    pools: PoolService,
    sessions: Arc<SessionService>,
    fetcher: Arc<UsageFetcher>,
    tokens: TokenEndpoint,
    device: DeviceFlow,
}

impl App {
    pub fn new(config: Config) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let accounts: Arc<dyn AccountRepository> =
            Arc::new(TomlAccountRepository::open(&config.paths.accounts));
        let pool_repo = Arc::new(TomlPoolRepository::open(&config.paths.pools));
        let runtimes = Arc::new(TomlPoolRuntimeRepository::open(&config.paths.runtime));
        let secrets: Arc<dyn SecretStore> =
            Arc::new(secrets::default_chain(&config.paths.secrets_dir));

        let tokens = TokenEndpoint::new(http.clone(), &config.auth.issuer, &config.auth.client_id)
            .context("invalid auth configuration")?
            .with_request_timeout(config.auth.request_timeout());
        let device = DeviceFlow::new(http.clone(), &config.auth.issuer, &config.auth.client_id)
            .context("invalid auth configuration")?
            .with_request_timeout(config.auth.request_timeout());
        let usage = UsageClient::new(http, &config.usage.base_url)
            .context("invalid usage configuration")?
            .with_request_timeout(config.auth.request_timeout());

        let freshness = Arc::new(
            TokenFreshness::new(secrets.clone(), Arc::new(tokens.clone()), clock.clone())
                .with_skew(config.refresh.skew()),
        );
        let records = Arc::new(AccountRecords::new(accounts.clone()));
        let sessions = Arc::new(SessionService::new(runtimes, clock.clone()));
        let fetcher = Arc::new(
            UsageFetcher::new(
                accounts.clone(),
                records.clone(),
                freshness.clone(),
                Arc::new(usage),
                clock.clone(),
            )
            .with_max_concurrent(config.usage.max_concurrent)
            .with_cache_ttl(config.usage.cache_ttl()),
        );

        Ok(Self {
            lifecycle: CredentialLifecycle::new(accounts.clone(), secrets),
            pools: PoolService::new(accounts.clone(), pool_repo, sessions.clone(), clock.clone()),
            clock,
            accounts,
            freshness,
            records,
            sessions,
            fetcher,
            tokens,
            device,
            config,
        })
    }

    pub async fn run(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        match command {
            Command::Login(LoginCommand::Browser { account }) => {
                self.login_browser(account, cancel).await
            }
            Command::Login(LoginCommand::Device { account }) => {
                self.login_device(account, cancel).await
            }
            Command::Auth(cmd) => self.auth(cmd).await,
            Command::Accounts(cmd) => self.accounts(cmd).await,
            Command::Usage(UsageCommand::Fetch { account, force }) => {
                self.fetch_usage(account, force, cancel).await
            }
            Command::Pool(args) => self.pool(args).await,
            Command::Session(cmd) => self.session(cmd).await,
            Command::Run(args) => self.run_child(args, cancel).await,
        }
    }

    async fn login_browser(
        &self,
        account: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let pkce = PkcePair::generate();
        let state = generate_state();
        let server = CallbackServer::start(&self.config.auth.callback_addr, &state)
            .await
            .context("failed to start the login callback listener")?;
        let redirect_uri = server.redirect_uri();
        let issuer = self.config.auth.issuer.trim_end_matches('/');
        let url = build_authorization_url(&AuthorizationRequest {
            auth_url: format!("{issuer}{}", oauth::AUTHORIZE_PATH),
            client_id: self.config.auth.client_id.clone(),
            redirect_uri: redirect_uri.clone(),
            scopes: oauth::SCOPES.iter().map(|s| (*s).to_owned()).collect(),
            state,
            code_challenge: pkce.challenge.clone(),
            originator: String::new(),
        })?;

        println!("Open this URL in your browser to sign in:\n\n  {url}\n");
        debug!(redirect_uri = %redirect_uri, "waiting for browser callback");
        let code = server
            .wait_for_code(self.config.auth.login_timeout(), cancel)
            .await?;

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(oauth::Error::Cancelled.into()),
            response = self.tokens.exchange_code(&code, &redirect_uri, &pkce.verifier) => response?,
        };
        self.store_login(account, response).await
    }

    async fn login_device(
        &self,
        account: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let code = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(oauth::Error::Cancelled.into()),
            code = self.device.request_device_code(oauth::SCOPES) => code?,
        };
        println!(
            "Open {} and enter the code {}\n",
            code.verification_url, code.user_code
        );
        let response = self
            .device
            .poll_token(
                &DevicePollRequest::from_code(&code, self.config.auth.login_timeout()),
                cancel,
            )
            .await?;
        self.store_login(account, response).await
    }

    /// Store freshly issued tokens through the credential lifecycle and
    /// label the account from the id-token claims.
    async fn store_login(&self, account: Option<String>, response: TokenResponse) -> Result<()> {
        let tokens = OAuthTokens::from_response(response, Utc::now());
        let claims = tokens.claims();
        let account_id = account
            .map(|a| a.trim().to_owned())
            .filter(|a| !a.is_empty())
            .or_else(|| claims.chatgpt_account_id.clone())
            .or_else(|| claims.email.clone())
            .context("the id token names no account; pass --account")?;

        let value = SecretString::new(tokens.encode()?);
        let stored = self
            .lifecycle
            .set_auth(
                &account_id,
                AuthMethod::ChatGpt,
                &secrets::oauth_tokens_key(&account_id),
                &value,
            )
            .await?;

        if let Some(plan_type) = &claims.plan_type {
            self.records.set_plan_type(&account_id, plan_type).await?;
        }
        if let Some(email) = &claims.email {
            if stored.name == Account::new(account_id.as_str()).name {
                self.records.set_name(&account_id, email).await?;
            }
        }
        info!(account_id = %account_id, "login stored");
        println!("Signed in: {account_id}");
        Ok(())
    }

    async fn auth(&self, cmd: AuthCommand) -> Result<()> {
        match cmd {
            AuthCommand::Set {
                account,
                method,
                key,
            } => {
                let method = AuthMethod::from(method);
                let key = key.unwrap_or_else(|| match method {
                    AuthMethod::ApiKey => secrets::api_key_key(account.trim()),
                    AuthMethod::ChatGpt => secrets::oauth_tokens_key(account.trim()),
                });
                let value = read_secret().await?;
                if method == AuthMethod::ChatGpt {
                    OAuthTokens::decode(value.expose())
                        .context("chatgpt credentials must be a stored OAuth token record")?;
                }
                let stored = self.lifecycle.set_auth(&account, method, &key, &value).await?;
                println!("{}: {} credentials stored", stored.id, method);
            }
            AuthCommand::Remove { account } => {
                let stored = self.lifecycle.remove_auth(&account).await?;
                println!("{}: credentials removed", stored.id);
            }
        }
        Ok(())
    }

    async fn accounts(&self, cmd: AccountsCommand) -> Result<()> {
        match cmd {
            AccountsCommand::List => {
                let statuses = self.records.status_all().await?;
                if statuses.is_empty() {
                    println!("no accounts");
                }
                for status in &statuses {
                    println!("{}", status_line(status));
                }
            }
            AccountsCommand::Rename { account, name } => {
                let stored = self.records.set_name(&account, &name).await?;
                println!("{}: renamed to {}", stored.id, stored.name);
            }
        }
        Ok(())
    }

    async fn fetch_usage(
        &self,
        account: Option<String>,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let report = self
            .fetcher
            .fetch_all(account.map(|a| vec![a]), force, cancel)
            .await?;
        for account in &report.fetched {
            println!("{}", status_line(&AccountStatus::from(account)));
        }
        for account in &report.skipped {
            println!("{} (cached)", status_line(&AccountStatus::from(account)));
        }
        for (id, err) in &report.failures {
            eprintln!("{id}: {err}");
        }
        Ok(())
    }

    async fn pool(&self, args: PoolArgs) -> Result<()> {
        let pool_id = args.pool.as_str();
        match args.command {
            PoolCommand::Activate => {
                let pool = self.pools.activate_pool(pool_id).await?;
                println!("{}: active, {} members", pool.id, pool.members.len());
            }
            PoolCommand::Deactivate => {
                let pool = self.pools.deactivate_pool(pool_id).await?;
                println!("{}: inactive", pool.id);
            }
            PoolCommand::Show => {
                let pool = self.pools.get_pool(pool_id).await?;
                println!(
                    "{} ({}) provider={} strategy={} active={} auto_sync={}",
                    pool.id,
                    pool.name,
                    pool.provider,
                    pool.strategy,
                    pool.active,
                    pool.auto_sync_members
                );
                println!("members: {}", pool.members.join(", "));
                if let Some(active) = self.sessions.active_account_id(pool_id).await? {
                    println!("active account: {active}");
                }
                if pool.active {
                    for account in self.pools.eligible_accounts(pool_id).await? {
                        println!("  {}", status_line(&AccountStatus::from(&account)));
                    }
                }
            }
            PoolCommand::Pick => {
                let pick = self.pools.pick_account(pool_id).await?;
                println!("{}", pick.account.id);
                if !pick.failover.is_empty() {
                    let failover: Vec<&str> =
                        pick.failover.iter().map(|a| a.id.as_str()).collect();
                    println!("failover: {}", failover.join(", "));
                }
            }
            PoolCommand::Next => {
                let current = self.sessions.active_account_id(pool_id).await?;
                let next = self.pools.next_account(pool_id, current.as_deref()).await?;
                self.sessions.set_active_account_id(pool_id, &next.id).await?;
                println!("{}", next.id);
            }
            PoolCommand::Switch { selector } => {
                let account = self.pools.switch_account(pool_id, &selector).await?;
                println!("{}", account.id);
            }
        }
        Ok(())
    }

    async fn session(&self, cmd: SessionCommand) -> Result<()> {
        match cmd {
            SessionCommand::Resolve { window } => {
                println!("{}", logical_session_id(&window)?);
            }
            SessionCommand::Attach {
                account,
                pool,
                window,
            } => {
                let logical = logical_session_id(&window)?;
                let (session_id, bootstrapped) = self
                    .sessions
                    .get_or_attach_account_session(&pool, &logical, &account)
                    .await?;
                let state = if bootstrapped { "new" } else { "existing" };
                println!("{session_id} ({state})");
            }
            SessionCommand::Remember {
                pool,
                summary,
                decisions,
                pending_tasks,
                code_refs,
                window,
            } => {
                let logical = logical_session_id(&window)?;
                let ledger = self
                    .sessions
                    .update_memory_packet(
                        &pool,
                        &logical,
                        MemoryPacket {
                            summary,
                            decisions,
                            pending_tasks,
                            last_code_refs: code_refs,
                            updated_at: None,
                        },
                    )
                    .await?;
                println!("{}: memory updated", ledger.logical_session_id);
            }
            SessionCommand::Show { pool, window } => {
                let logical = logical_session_id(&window)?;
                let Some(ledger) = self.sessions.ledger(&pool, &logical).await? else {
                    println!("{logical}: no sessions");
                    return Ok(());
                };
                println!("{logical}");
                for (account, session) in &ledger.account_sessions {
                    println!("  {account}: {session}");
                }
                let memory = &ledger.memory;
                if !memory.summary.is_empty() {
                    println!("summary: {}", memory.summary);
                }
                for decision in &memory.decisions {
                    println!("decision: {decision}");
                }
                for task in &memory.pending_tasks {
                    println!("pending: {task}");
                }
                for code_ref in &memory.last_code_refs {
                    println!("code: {code_ref}");
                }
            }
        }
        Ok(())
    }
}

impl App {
    /// Keep the pool's active account while it stays eligible, else pick
    /// the best one; then attach its provider session for this window.
    pub async fn prepare_run(&self, pool_id: &str, window: &WindowArgs) -> Result<RunContext> {
        let active = match self.sessions.active_account_id(pool_id).await? {
            Some(id) if self.pools.is_eligible_account(pool_id, &id).await? => Some(id),
            _ => None,
        };
        let account_id = match active {
            Some(id) => id,
            None => self.pools.pick_account(pool_id).await?.account.id,
        };
        self.sessions
            .set_active_account_id(pool_id, &account_id)
            .await?;

        let logical_session_id = logical_session_id(window)?;
        let (provider_session_id, _) = self
            .sessions
            .get_or_attach_account_session(pool_id, &logical_session_id, &account_id)
            .await
            .context("failed to resolve the provider session")?;
        Ok(RunContext {
            pool_id: pool_id.trim().to_owned(),
            account_id,
            logical_session_id,
            provider_session_id,
        })
    }

    async fn run_child(&self, args: RunArgs, cancel: &CancellationToken) -> Result<()> {
        let Some((program, rest)) = args.command.split_first() else {
            bail!("run requires a command after '--'");
        };
        let ctx = self.prepare_run(&args.pool, &args.window).await?;
        if opencode::is_opencode(program) {
            self.sync_opencode(&ctx.account_id, cancel).await?;
        }

        info!(
            pool_id = %ctx.pool_id,
            account_id = %ctx.account_id,
            provider_session_id = %ctx.provider_session_id,
            program = %program,
            "starting child command"
        );
        // The child shares the terminal and handles Ctrl-C itself.
        let status = tokio::process::Command::new(program)
            .args(rest)
            .envs(ctx.env())
            .kill_on_drop(true)
            .status()
            .await
            .with_context(|| format!("failed to start {program}"))?;
        if !status.success() {
            bail!("{program} exited with {status}");
        }
        Ok(())
    }

    async fn sync_opencode(&self, account_id: &str, cancel: &CancellationToken) -> Result<()> {
        let account = self.accounts.get_by_id(account_id).await?;
        if account.auth.method != Some(AuthMethod::ChatGpt) {
            warn!(account_id, "opencode sync skipped: account has no ChatGPT tokens");
            return Ok(());
        }
        let tokens = self
            .freshness
            .ensure_fresh_tokens(&account, None, false, cancel)
            .await?;
        let path = opencode::auth_path()?;
        opencode::sync_tokens(&path, &tokens, self.clock.now()).await?;
        debug!(account_id, path = %path.display(), "opencode auth synced");
        Ok(())
    }
}

/// The secret from `OA_SECRET`, else all of stdin, trimmed.
async fn read_secret() -> Result<SecretString> {
    if let Ok(value) = std::env::var(SECRET_ENV) {
        return Ok(SecretString::new(value).trimmed());
    }
    let mut value = String::new();
    tokio::io::stdin()
        .read_to_string(&mut value)
        .await
        .context("failed to read the secret from stdin")?;
    let value = SecretString::new(value).trimmed();
    if value.is_empty() {
        bail!("no secret given: set {SECRET_ENV} or pipe it on stdin");
    }
    Ok(value)
}

fn window_fingerprint(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_owned)
        .into_iter()
        .chain(WINDOW_ENV.iter().filter_map(|key| std::env::var(key).ok()))
        .map(|v| v.trim().to_owned())
        .find(|v| !v.is_empty())
        .unwrap_or_else(|| "default".to_owned())
}

fn logical_session_id(args: &WindowArgs) -> Result<String> {
    let workspace = match &args.workspace {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("failed to read the current directory")?,
    };
    Ok(resolve_logical_session_id(
        &workspace_root(&workspace),
        &window_fingerprint(args.window.as_deref()),
    ))
}

fn workspace_root(dir: &Path) -> String {
    dir.canonicalize()
        .unwrap_or_else(|_| dir.to_path_buf())
        .display()
        .to_string()
}

fn percent(snapshot: Option<&domain::LimitSnapshot>) -> String {
    snapshot.map_or_else(|| "-".to_owned(), |s| format!("{:.0}%", s.percent))
}

fn status_line(status: &AccountStatus) -> String {
    let method = status.auth_method.map_or("none", |m| m.as_str());
    let plan = if status.plan_type.is_empty() {
        "-"
    } else {
        status.plan_type.as_str()
    };
    format!(
        "{}  {}  auth={}  plan={}  daily={}  weekly={}  tokens={}",
        status.id,
        status.name,
        method,
        plan,
        percent(status.daily.as_ref()),
        percent(status.weekly.as_ref()),
        compact_number(status.usage.blended_total()),
    )
}
