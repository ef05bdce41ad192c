use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use forumsnap_storage::ThreadStore;
use forumsnap_sync::{maybe_build_scheduler, SyncConfig, SyncService};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "forumsnap")]
#[command(about = "Discord forum thread snapshot sync")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass and print the run summary as JSON.
    Sync {
        /// Replay a captured fixture bundle instead of calling Discord.
        #[arg(long)]
        fixture: Option<PathBuf>,
    },
    /// Apply pending schema migrations to DATABASE_URL.
    Migrate,
    /// Serve the HTTP front door, plus the cron trigger when enabled.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { fixture: None }) {
        Commands::Sync { fixture } => {
            if fixture.is_some() {
                config.fixture_path = fixture;
            }
            let service = SyncService::from_config(&config).await?;
            let result = service.run_once().await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            if !result.success {
                std::process::exit(1);
            }
        }
        Commands::Migrate => {
            let store = ThreadStore::connect(&config.database_url)
                .await
                .with_context(|| format!("connecting to {}", config.database_url))?;
            store.migrate().await?;
            info!(database_url = %config.database_url, "migrations applied");
        }
        Commands::Serve => {
            let service = Arc::new(SyncService::from_config(&config).await?);
            let scheduler = maybe_build_scheduler(service.clone(), &config).await?;
            if let Some(sched) = &scheduler {
                sched.start().await.context("starting scheduler")?;
                info!(cron = %config.sync_cron, "scheduled sync enabled");
            }
            forumsnap_web::serve(service, config.web_port).await?;
        }
    }

    Ok(())
}

/// `RUST_LOG` drives filtering; `FORUMSNAP_LOG_FORMAT=json` switches to
/// structured output.
fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match std::env::var("FORUMSNAP_LOG_FORMAT").as_deref() {
        Ok("json") => registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}
