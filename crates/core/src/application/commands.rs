// Background Command Dispatch

use crate::application::batch_lifecycle::BatchLifecycle;
use crate::application::cards::CardService;
use crate::application::stations::StationSyncService;
use crate::domain::BackgroundCommand;
use crate::error::Result;
use crate::port::TimeProvider;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Commands slower than this log a performance warning
pub const SLOW_COMMAND_THRESHOLD: Duration = Duration::from_secs(3);

/// Entry point the worker uses to run a dequeued command
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn execute(&self, command: &BackgroundCommand) -> Result<()>;

    /// Runs once after the command's job has failed for the last time
    async fn on_exhausted(&self, _command: &BackgroundCommand, _error: &str) -> Result<()> {
        Ok(())
    }
}

/// Routes each command to the service that owns it
pub struct CommandDispatcher {
    cards: Arc<CardService>,
    lifecycle: Arc<BatchLifecycle>,
    stations: Arc<StationSyncService>,
    time_provider: Arc<dyn TimeProvider>,
}

impl CommandDispatcher {
    pub fn new(
        cards: Arc<CardService>,
        lifecycle: Arc<BatchLifecycle>,
        stations: Arc<StationSyncService>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            cards,
            lifecycle,
            stations,
            time_provider,
        }
    }

    async fn route(&self, command: &BackgroundCommand) -> Result<()> {
        match command {
            BackgroundCommand::DeleteExpiredCards => {
                self.cards
                    .delete_expired_cards(self.time_provider.today())
                    .await?;
            }
            BackgroundCommand::QueueImportBatch { batch_id } => {
                self.lifecycle.queue_batch(*batch_id).await?;
            }
            BackgroundCommand::ProcessImportBatch { batch_id } => {
                self.lifecycle.process_batch(*batch_id).await?;
            }
            BackgroundCommand::RequeueStalledBatches => {
                self.lifecycle.requeue_stalled_batches().await?;
            }
            BackgroundCommand::SweepOrphanBlobs => {
                self.lifecycle.sweep_orphan_blobs().await?;
            }
            BackgroundCommand::SyncStations => {
                self.stations.sync().await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl CommandHandler for CommandDispatcher {
    async fn execute(&self, command: &BackgroundCommand) -> Result<()> {
        let name = command.name();
        info!(command = name, "Executing background command");

        let started = Instant::now();
        let result = self.route(command).await;
        let elapsed = started.elapsed();
        let elapsed_ms = elapsed.as_millis() as u64;

        match &result {
            Ok(()) => info!(command = name, elapsed_ms = elapsed_ms, "Background command succeeded"),
            Err(e) => error!(
                command = name,
                elapsed_ms = elapsed_ms,
                error = %e,
                "Background command failed"
            ),
        }
        if elapsed > SLOW_COMMAND_THRESHOLD {
            warn!(
                command = name,
                elapsed_ms = elapsed_ms,
                threshold_ms = SLOW_COMMAND_THRESHOLD.as_millis() as u64,
                "Long running background command"
            );
        }

        result
    }

    async fn on_exhausted(&self, command: &BackgroundCommand, error: &str) -> Result<()> {
        match command {
            // A batch whose processing job gave up would otherwise stay in flight
            BackgroundCommand::ProcessImportBatch { batch_id } => {
                self.lifecycle.fail_batch(*batch_id, error).await
            }
            // Still Uploaded or unassigned, so the stalled batch sweep retries it
            BackgroundCommand::QueueImportBatch { .. } => Ok(()),
            _ => Ok(()),
        }
    }
}
