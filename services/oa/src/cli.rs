//! Command-line surface of `oa`

use clap::{Args, Parser, Subcommand, ValueEnum};
use domain::{AuthMethod, DEFAULT_OPENAI_POOL_ID};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "oa", version, about = "Manage and rotate OpenAI accounts")]
pub struct Cli {
    /// Config file (default: $OA_CONFIG, then ~/.codex/oa.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sign in with ChatGPT and store the tokens
    #[command(subcommand)]
    Login(LoginCommand),

    /// Set or remove stored credentials
    #[command(subcommand)]
    Auth(AuthCommand),

    /// Inspect accounts
    #[command(subcommand)]
    Accounts(AccountsCommand),

    /// Fetch usage limits from the provider
    #[command(subcommand)]
    Usage(UsageCommand),

    /// Manage the rotation pool
    Pool(PoolArgs),

    /// Session continuity across account switches
    #[command(subcommand)]
    Session(SessionCommand),

    /// Run a command as the pool-selected account
    Run(RunArgs),
}

#[derive(Debug, Subcommand)]
pub enum LoginCommand {
    /// PKCE login through the browser and a local callback listener
    Browser {
        /// Account id (default: the ChatGPT account id from the id token)
        #[arg(long)]
        account: Option<String>,
    },
    /// Device-code login for machines without a browser
    Device {
        #[arg(long)]
        account: Option<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum MethodArg {
    #[value(name = "api_key")]
    ApiKey,
    #[value(name = "chatgpt")]
    ChatGpt,
}

impl From<MethodArg> for AuthMethod {
    fn from(method: MethodArg) -> Self {
        match method {
            MethodArg::ApiKey => AuthMethod::ApiKey,
            MethodArg::ChatGpt => AuthMethod::ChatGpt,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum AuthCommand {
    /// Store a secret for an account; the value comes from OA_SECRET or stdin
    Set {
        account: String,
        #[arg(long, value_enum)]
        method: MethodArg,
        /// Secret key (default: openai://{account}/api_key or oauth_tokens)
        #[arg(long)]
        key: Option<String>,
    },
    /// Delete every stored secret of an account
    Remove { account: String },
}

#[derive(Debug, Subcommand)]
pub enum AccountsCommand {
    /// One line per account
    List,
    /// Rename an account
    Rename { account: String, name: String },
}

#[derive(Debug, Subcommand)]
pub enum UsageCommand {
    /// Fetch usage for one account or every ChatGPT account
    Fetch {
        #[arg(long)]
        account: Option<String>,
        /// Ignore the cached snapshot
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct PoolArgs {
    #[arg(long, default_value = DEFAULT_OPENAI_POOL_ID)]
    pub pool: String,

    #[command(subcommand)]
    pub command: PoolCommand,
}

#[derive(Debug, Subcommand)]
pub enum PoolCommand {
    /// Activate the pool, syncing members when auto-sync is on
    Activate,
    Deactivate,
    /// Pool settings, members and eligible accounts in pick order
    Show,
    /// The account with the lowest weekly usage and its failover order
    Pick,
    /// Rotate to the eligible account after the active one
    Next,
    /// Make an eligible account active, by id or name
    Switch { selector: String },
}

#[derive(Debug, Args)]
pub struct WindowArgs {
    /// Workspace root (default: current directory)
    #[arg(long)]
    pub workspace: Option<PathBuf>,
    /// Terminal window fingerprint (default: $OA_WINDOW_FINGERPRINT,
    /// $TERM_SESSION_ID, $TMUX_PANE, then "default")
    #[arg(long)]
    pub window: Option<String>,
}

/// `oa run [--pool ID] -- <command> [args...]`
///
/// The child sees `OA_POOL_ID`, `OA_ACTIVE_ACCOUNT`, `OA_LOGICAL_SESSION_ID`
/// and `OA_PROVIDER_SESSION_ID`.
#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long, default_value = DEFAULT_OPENAI_POOL_ID)]
    pub pool: String,
    #[command(flatten)]
    pub window: WindowArgs,
    #[arg(
        required = true,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    pub command: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum SessionCommand {
    /// Print the logical session id of this workspace and window
    Resolve {
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Get or create the provider session of an account
    Attach {
        #[arg(long)]
        account: String,
        #[arg(long, default_value = DEFAULT_OPENAI_POOL_ID)]
        pool: String,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Replace the memory packet carried across account switches
    Remember {
        #[arg(long, default_value = DEFAULT_OPENAI_POOL_ID)]
        pool: String,
        #[arg(long, default_value = "")]
        summary: String,
        #[arg(long = "decision")]
        decisions: Vec<String>,
        #[arg(long = "task")]
        pending_tasks: Vec<String>,
        #[arg(long = "code-ref")]
        code_refs: Vec<String>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Show the ledger of this workspace and window
    Show {
        #[arg(long, default_value = DEFAULT_OPENAI_POOL_ID)]
        pool: String,
        #[command(flatten)]
        window: WindowArgs,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_tree_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn auth_set_parses_method() {
        let cli = Cli::parse_from(["oa", "auth", "set", "acc-1", "--method", "api_key"]);
        let Command::Auth(AuthCommand::Set {
            account,
            method,
            key,
        }) = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(account, "acc-1");
        assert_eq!(AuthMethod::from(method), AuthMethod::ApiKey);
        assert!(key.is_none());
    }

    #[test]
    fn pool_defaults_to_the_openai_pool() {
        let cli = Cli::parse_from(["oa", "pool", "pick"]);
        let Command::Pool(args) = cli.command else {
            panic!("wrong command");
        };
        assert_eq!(args.pool, DEFAULT_OPENAI_POOL_ID);
        assert!(matches!(args.command, PoolCommand::Pick));
    }

    #[test]
    fn remember_collects_repeated_flags() {
        let cli = Cli::parse_from([
            "oa",
            "session",
            "remember",
            "--summary",
            "parser rewrite",
            "--task",
            "fix tests",
            "--task",
            "update docs",
        ]);
        let Command::Session(SessionCommand::Remember {
            summary,
            pending_tasks,
            ..
        }) = cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(summary, "parser rewrite");
        assert_eq!(pending_tasks, vec!["fix tests", "update docs"]);
    }

    #[test]
    fn run_keeps_child_flags() {
        let cli = Cli::parse_from([
            "oa", "run", "--pool", "team", "--", "codex", "--model", "o3", "-q",
        ]);
        let Command::Run(args) = cli.command else {
            panic!("wrong command");
        };
        assert_eq!(args.pool, "team");
        assert_eq!(args.command, vec!["codex", "--model", "o3", "-q"]);
    }

    #[test]
    fn run_requires_a_command() {
        assert!(Cli::try_parse_from(["oa", "run"]).is_err());
    }

    #[test]
    fn config_flag_is_global() {
        let cli = Cli::parse_from(["oa", "accounts", "list", "--config", "/tmp/oa.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/oa.toml")));
    }
}
