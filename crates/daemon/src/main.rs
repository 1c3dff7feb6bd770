//! Transit history daemon - main entry point
//! Background worker plus operator commands for cards and imports

mod config;
mod wiring;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use transit_core::application::{CardRequest, CommandHandler, ImportContent, ImportHistoryRequest};
use transit_core::domain::{BackgroundCommand, CardType};
use transit_core::port::ClaimsIdentity;
use transit_infra_system::content_type_for;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::wiring::Services;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "transit-daemon")]
#[command(about = "Transit card travel history import daemon", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background worker until Ctrl+C (default)
    Run,

    /// Register a card for a user
    AddCard {
        /// Owning user id
        #[arg(long, env = "TRANSIT_USER")]
        user: Uuid,

        #[arg(long)]
        alias: String,

        #[arg(long)]
        number: String,

        #[arg(long, value_enum, default_value = "gold")]
        card_type: CardTypeArg,

        /// Expiry date (YYYY-MM-DD)
        #[arg(long)]
        expiry: NaiveDate,
    },

    /// List a user's cards
    ListCards {
        #[arg(long, env = "TRANSIT_USER")]
        user: Uuid,
    },

    /// Upload a travel history export for one of the user's cards
    Import {
        #[arg(long, env = "TRANSIT_USER")]
        user: Uuid,

        /// Card the history belongs to
        #[arg(long)]
        card: Uuid,

        /// CSV export to upload
        file: PathBuf,
    },

    /// Refresh stations from the operator's list once
    SyncStations,
}

#[derive(Clone, Copy, ValueEnum)]
enum CardTypeArg {
    Gold,
    Silver,
    Bronze,
}

impl From<CardTypeArg> for CardType {
    fn from(value: CardTypeArg) -> Self {
        match value {
            CardTypeArg::Gold => CardType::Gold,
            CardTypeArg::Silver => CardType::Silver,
            CardTypeArg::Bronze => CardType::Bronze,
        }
    }
}

/// Logs go to stderr so command output on stdout stays machine-readable
fn init_logging() -> Result<()> {
    let log_format = std::env::var("TRANSIT_LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("transit=info"))
        .context("Failed to create env filter")?;

    match log_format.as_str() {
        "json" => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        _ => tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging()?;

    let config = AppConfig::load().context("Failed to load configuration")?;
    let services = Services::build(config).await?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(services).await,
        Commands::AddCard {
            user,
            alias,
            number,
            card_type,
            expiry,
        } => {
            let identity = Arc::new(ClaimsIdentity::for_user(user, &[]));
            let card = services
                .cards
                .create(
                    identity,
                    CardRequest {
                        alias,
                        number,
                        card_type: card_type.into(),
                        expiry_date: expiry,
                    },
                )
                .await?;
            println!("{}", card.id);
            Ok(())
        }
        Commands::ListCards { user } => {
            let identity = Arc::new(ClaimsIdentity::for_user(user, &[]));
            for card in services.cards.list(identity).await? {
                println!(
                    "{}\t{}\t{}\t{:?}\t{}",
                    card.id, card.alias, card.number, card.card_type, card.expiry_date
                );
            }
            Ok(())
        }
        Commands::Import { user, card, file } => import(services, user, card, file).await,
        Commands::SyncStations => {
            services
                .commands
                .execute(&BackgroundCommand::SyncStations)
                .await?;
            Ok(())
        }
    }
}

async fn run(services: Services) -> Result<()> {
    info!("Transit daemon v{} starting...", VERSION);

    info!("Running crash recovery...");
    services.recover().await;
    services.schedule_maintenance().await?;

    let shutdown = CancellationToken::new();
    let consumer_handle = services.spawn_consumer(shutdown.clone());

    info!("Starting worker...");
    let worker = services.worker();
    let worker_shutdown = shutdown.clone();
    let worker_handle = tokio::spawn(async move {
        if let Err(e) = worker.run(worker_shutdown).await {
            tracing::error!(error = ?e, "Worker failed");
        }
    });

    info!("System ready. Press Ctrl+C to shutdown");
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    shutdown.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, worker_handle).await;
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer_handle).await;

    info!("Shutdown complete.");
    Ok(())
}

/// One-shot upload; the created batch is queued and picked up by `run`
async fn import(services: Services, user: Uuid, card: Uuid, file: PathBuf) -> Result<()> {
    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("{} has no usable file name", file.display()))?;
    let extension = file
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_ascii_lowercase()))
        .unwrap_or_default();
    let content = tokio::fs::File::open(&file)
        .await
        .with_context(|| format!("opening {}", file.display()))?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_interrupt.cancel();
        }
    });

    let consumer_shutdown = CancellationToken::new();
    let consumer_handle = services.spawn_consumer(consumer_shutdown.clone());

    let identity = Arc::new(ClaimsIdentity::for_user(user, &[]));
    let result = services
        .imports
        .import(
            identity,
            ImportHistoryRequest {
                card_id: card,
                file_name,
                content_type: content_type_for(&extension).to_string(),
                content: ImportContent::Seekable(Box::new(content)),
            },
            &cancel,
        )
        .await;

    // Drains the created event into the job queue before exiting
    consumer_shutdown.cancel();
    let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, consumer_handle).await;

    let response = result?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}
