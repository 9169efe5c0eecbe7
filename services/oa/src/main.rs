//! `oa`: multi-account credential and rotation manager
//!
//! 1. Parses the command line
//! 2. Initializes logging on stderr (`LOG_LEVEL`, then `RUST_LOG`, default
//!    `warn`; `OA_LOG_FORMAT=json` for JSON lines)
//! 3. Loads configuration and wires the services
//! 4. Runs one command; Ctrl-C cancels logins and usage fetches

mod app;
mod cli;
mod config;
mod opencode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::app::App;
use crate::cli::Cli;
use crate::config::Config;

fn init_tracing() {
    let json = std::env::var("OA_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with(json.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();
}

/// Cancel `token` on the first Ctrl-C.
fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("received SIGINT, cancelling");
                token.cancel();
            }
            Err(e) => warn!(error = %e, "failed to install Ctrl+C handler"),
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;
    debug!(
        accounts = %config.paths.accounts.display(),
        issuer = %config.auth.issuer,
        usage_base_url = %config.usage.base_url,
        "configuration loaded"
    );

    let app = App::new(config)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(cancel.clone());

    app.run(cli.command, &cancel).await
}
