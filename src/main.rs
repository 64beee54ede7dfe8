#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! # gamemux
//!
//! Connection-multiplexing supervisor for multi-user game services.
//!
//! gamemux listens for clients over TCP (dual-stack), authenticates them,
//! and bridges each session to a per-user game subprocess. A client can
//! disconnect at any time — the game keeps running and a later login by
//! the same user is spliced back onto it.
//!
//! ## Subcommands
//!
//! - `gamemux serve` (default) — run the supervisor
//! - `gamemux supervise` — run under a restart-on-crash wrapper

mod supervisor;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gamemux::{Config, Server, UserTable};

/// Connection-multiplexing supervisor for multi-user game services.
#[derive(Parser)]
#[command(name = "gamemux", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
    /// Run as supervisor: starts the server and restarts it on crash.
    Supervise {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Supervise { config }) => {
            run_supervisor_mode(config.as_deref()).await;
        }
        Some(Commands::Serve { config }) => {
            run_server(config.as_deref()).await;
        }
        None => {
            run_server(None).await;
        }
    }
}

async fn run_supervisor_mode(config_path: Option<&str>) -> ! {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("gamemux supervisor starting");
    let code = supervisor::run_supervisor(config_path, &config.supervisor).await;
    std::process::exit(code);
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    // Validate config before binding anything
    let validation_errors = config.validate();
    if !validation_errors.is_empty() {
        for err in &validation_errors {
            tracing::error!("Config error: {err}");
        }
        std::process::exit(1);
    }

    info!("gamemux v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Game command: {}", config.game.command);
    if config.auth.users.is_empty() {
        warn!("No users configured — every login will be rejected");
    }

    let authenticator = Arc::new(UserTable::new(config.auth.users.clone()));
    let server = match Server::bind(config, authenticator) {
        Ok(server) => server,
        // The listener set already logged what went wrong.
        Err(_) => std::process::exit(1),
    };
    for addr in server.local_addrs() {
        info!("Listening on {addr}");
    }

    // SIGTERM and SIGINT both trigger the two-phase drain.
    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to register SIGTERM");
        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT"),
            _ = sigterm.recv() => info!("Received SIGTERM"),
        }
        signal_token.cancel();
    });

    server.run(shutdown).await;
    info!("Goodbye");
}
