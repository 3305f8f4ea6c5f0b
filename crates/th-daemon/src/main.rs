//! termhub: durable shells for remote clients.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use th_bridge::auth::JwtAuthenticator;
use th_core::config::Config;
use th_core::types::UserId;
use th_daemon::Daemon;
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// termhub -- keep shells alive across client disconnects.
#[derive(Parser)]
#[command(name = "termhub", version, about)]
struct Cli {
    /// Config file (defaults to ~/.termhub/config.toml).
    #[arg(long, global = true, env = "TERMHUB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the server (default when no subcommand is given).
    Serve,

    /// Mint a bearer token for a user.
    Token {
        /// User id placed in the token.
        user_id: String,
        /// Display name; defaults to the user id.
        #[arg(long)]
        username: Option<String>,
        /// Lifetime in seconds; defaults to `auth.token_ttl_secs`.
        #[arg(long)]
        ttl_secs: Option<u64>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    match cli.command {
        None | Some(Commands::Serve) => serve(config).await,
        Some(Commands::Token {
            user_id,
            username,
            ttl_secs,
        }) => {
            let secret = config
                .auth
                .secret()
                .with_context(|| format!("{} is not set", config.auth.secret_env))?;
            let ttl = Duration::from_secs(ttl_secs.unwrap_or(config.auth.token_ttl_secs));
            let username = username.unwrap_or_else(|| user_id.clone());
            let token = JwtAuthenticator::new(secret).issue_token(&UserId::new(user_id), &username, ttl)?;
            println!("{token}");
            Ok(())
        }
        Some(Commands::Config) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    th_telemetry::logging::init_from_config("termhub", &config.logging);
    info!(version = env!("CARGO_PKG_VERSION"), "termhub starting");

    let daemon = Daemon::new(config)?;
    let shutdown = daemon.shutdown_handle();

    // Wire ctrl-c to trigger graceful shutdown.
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
