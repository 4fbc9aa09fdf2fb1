use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use windsite::config::WindsiteConfig;
use windsite::intent::classifier;
use windsite::orchestrator::Orchestrator;
use windsite::poll::PollController;
use windsite::runner::RunnerRegistry;
use windsite::server::{ServerConfig, start_server};
use windsite::store::models::MessageRole;
use windsite::store::{DbHandle, SiteDb};

#[derive(Parser)]
#[command(name = "windsite")]
#[command(version, about = "Chat-driven wind site assessment orchestrator")]
struct Cli {
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to the SQLite database.
    #[arg(long, default_value = ".windsite/site.db", global = true)]
    db: PathBuf,

    /// Path to windsite.toml.
    #[arg(long, default_value = "windsite.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP server.
    Serve {
        #[arg(short, long, default_value = "3920")]
        port: u16,
        /// Bind on all interfaces and allow any origin.
        #[arg(long)]
        dev: bool,
    },
    /// Send one query through the orchestrator and wait for the result.
    Ask {
        query: String,
        #[arg(short, long, default_value = "cli")]
        session: String,
    },
    /// List projects.
    Projects,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Serve { port, dev } => {
            start_server(ServerConfig {
                port,
                db_path: cli.db,
                config_path: cli.config,
                dev_mode: dev,
            })
            .await
        }
        Commands::Ask { query, session } => ask(&cli.db, &cli.config, &query, &session).await,
        Commands::Projects => projects(&cli.db).await,
    }
}

/// One-shot chat turn: classify, dispatch, poll until the turn finalizes,
/// print the result. Exercises the same path the server does.
async fn ask(db_path: &Path, config_path: &Path, query: &str, session: &str) -> Result<()> {
    let config = WindsiteConfig::load(config_path)?;
    for warning in config.validate() {
        tracing::warn!("config: {}", warning);
    }
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(SiteDb::new(db_path)?);

    let session_owned = session.to_string();
    let history: Vec<String> = db
        .call(move |db| db.messages_since(&session_owned, 0))
        .await?
        .into_iter()
        .filter(|m| m.role == MessageRole::User)
        .map(|m| m.content)
        .collect();

    let session_owned = session.to_string();
    let query_owned = query.to_string();
    db.call(move |db| {
        db.append_message(&session_owned, MessageRole::User, &query_owned, true)
    })
    .await?;

    let intent = classifier::classify(query, &history);
    let orchestrator = Orchestrator::new(
        db.clone(),
        Arc::new(RunnerRegistry::from_config(&config)),
        Duration::from_secs(config.sync_budget_secs),
    );
    orchestrator
        .handle(intent, session)
        .await
        .map_err(|e| anyhow::anyhow!("{}", e))?;

    let mut poller = PollController::new(
        db,
        session,
        Duration::from_secs(config.poll_interval_secs.max(1)),
    );
    let cancel = CancellationToken::new();
    let message = poller
        .wait_for_completion(&cancel)
        .await
        .context("Polling was cancelled")?;

    for step in &message.thought_steps {
        match &step.detail {
            Some(detail) => println!("  · {} ({})", step.label, detail),
            None => println!("  · {}", step.label),
        }
    }
    println!("{}", message.content);
    if let Some(artifacts) = &message.artifacts {
        println!("{}", serde_json::to_string_pretty(artifacts)?);
    }
    Ok(())
}

async fn projects(db_path: &Path) -> Result<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = DbHandle::new(SiteDb::new(db_path)?);
    let projects = db.call(|db| db.list_projects()).await?;
    if projects.is_empty() {
        println!("No projects yet.");
        return Ok(());
    }
    for project in projects {
        println!(
            "{}  {}  [{}]",
            project.id,
            project.name,
            project.status.as_str()
        );
    }
    Ok(())
}
