use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rave_manager::{SessionApi, Supervisor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

mod api_client;
mod commands;
mod config;
mod events;

use crate::api_client::RestApi;
use crate::config::{ApiConfig, FileConfig, RaveBotConfig};

#[derive(Parser)]
#[command(name = "ravebot")]
#[command(about = "Keeps one account present in every session it is invited to")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Custom data directory (defaults to ~/.ravebot)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Join every desired session and stay until Ctrl-C (the default)
    Run(RunArgs),

    /// Print the sessions the account would join
    Sessions(SessionsArgs),

    /// Print the resolved configuration with secrets masked
    Config,
}

#[derive(Parser, Default)]
struct RunArgs {
    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Parser)]
struct SessionsArgs {
    /// Output as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None => run(RunArgs::default(), cli.data_dir).await,
        Some(Commands::Run(args)) => run(args, cli.data_dir).await,
        Some(Commands::Sessions(args)) => sessions_command(cli.data_dir, args.json).await,
        Some(Commands::Config) => config_command(cli.data_dir),
    }
}

fn init_logging(default_directive: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load(data_dir: Option<PathBuf>) -> Result<(RaveBotConfig, FileConfig)> {
    let dirs = RaveBotConfig::new(data_dir)?;
    let fc: FileConfig = config::load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Failed to load {}", dirs.config_toml_path().display()))?;
    Ok((dirs, fc))
}

async fn run(args: RunArgs, data_dir: Option<PathBuf>) -> Result<()> {
    let default_directive = if args.debug {
        "ravebot=debug,rave_manager=debug,info"
    } else {
        "ravebot=info,rave_manager=info,warn"
    };
    init_logging(default_directive);

    let (dirs, fc) = load(data_dir)?;
    let supervisor_config = config::supervisor_config(&fc)?;
    let api = RestApi::new(&ApiConfig::from_file(&fc.api), &supervisor_config.account)?;

    info!(
        user = supervisor_config.account.user_id,
        mode = ?supervisor_config.session_mode,
        limit = supervisor_config.session_limit,
        "Starting Rave bot"
    );

    let supervisor = Supervisor::new(Arc::new(api), supervisor_config);
    commands::register(&supervisor).await;
    events::register(&supervisor, &fc.agent).await;

    supervisor.start();
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C, shutting down");
    }
    info!("Shutdown requested");

    let status = supervisor.status().await;
    supervisor.stop().await;

    let path = dirs.last_status_path();
    std::fs::write(&path, serde_json::to_string_pretty(&status)?)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!(
        sessions = status.sessions.len(),
        started = status.metrics.sessions.started,
        failed = status.metrics.sessions.failed,
        "Stopped; session table written to {}",
        path.display()
    );
    Ok(())
}

async fn sessions_command(data_dir: Option<PathBuf>, json: bool) -> Result<()> {
    init_logging("ravebot=warn,warn");

    let (_, fc) = load(data_dir)?;
    let account = fc.account.to_account()?;
    let api = RestApi::new(&ApiConfig::from_file(&fc.api), &account)?;
    let sc = &fc.supervisor;
    let sessions = api
        .list_sessions(sc.session_mode, sc.session_limit, &sc.lang)
        .await
        .context("Failed to list sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    for session in &sessions {
        println!("{}  {} members", session.session_id, session.members.len());
    }
    Ok(())
}

fn config_command(data_dir: Option<PathBuf>) -> Result<()> {
    let (dirs, fc) = load(data_dir)?;
    println!("# {}", dirs.config_toml_path().display());
    print!(
        "{}",
        toml::to_string_pretty(&fc.redacted()).context("Failed to render configuration")?
    );
    Ok(())
}
