// Composition root: builds every adapter and service from AppConfig

use crate::config::AppConfig;
use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use transit_core::application::{
    default_dispatcher, BatchLifecycle, CardService, CommandDispatcher, ImportBatchCreatedConsumer,
    ImportHistoryService, QueueJobScheduler, RecoveryService, RetryPolicy, StationSyncService,
    Worker,
};
use transit_core::domain::BackgroundCommand;
use transit_core::port::id_provider::UuidProvider;
use transit_core::port::time_provider::SystemTimeProvider;
use transit_core::port::{
    EntityStore, IdProvider, IntegrationEventPublisher, JobQueue, JobScheduler, TimeProvider,
};
use transit_core::repository::protections::default_registry;
use transit_infra_sqlite::{
    create_pool, run_migrations, SqliteEntityStore, SqliteJobQueue, SqliteStationRepository,
};
use transit_infra_system::{
    BroadcastEventBus, CsvHistoryInspector, HttpStationSource, LocalBlobStore,
};

pub const CARD_CLEANUP_JOB: &str = "delete-expired-cards";
pub const BLOB_SWEEP_JOB: &str = "sweep-orphan-blobs";
pub const STALLED_BATCH_JOB: &str = "requeue-stalled-batches";
pub const STATION_SYNC_JOB: &str = "sync-stations";

pub struct Services {
    pub config: AppConfig,
    pub time_provider: Arc<dyn TimeProvider>,
    pub id_provider: Arc<dyn IdProvider>,
    pub jobs: Arc<dyn JobQueue>,
    pub bus: BroadcastEventBus,
    pub scheduler: Arc<dyn JobScheduler>,
    pub cards: Arc<CardService>,
    pub imports: Arc<ImportHistoryService>,
    pub commands: Arc<CommandDispatcher>,
}

/// Directory that must exist before SQLite can create the database file
fn database_dir(url: &str) -> Option<&Path> {
    if url.contains(":memory:") {
        return None;
    }
    let path = url.strip_prefix("sqlite://").unwrap_or(url);
    let path = path.strip_prefix("sqlite:").unwrap_or(path);
    let path = path.split('?').next().unwrap_or(path);
    Path::new(path).parent().filter(|p| !p.as_os_str().is_empty())
}

impl Services {
    pub async fn build(config: AppConfig) -> Result<Self> {
        if let Some(dir) = database_dir(&config.database.url) {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating database directory {}", dir.display()))?;
        }
        std::fs::create_dir_all(&config.blob.root)
            .with_context(|| format!("creating blob root {}", config.blob.root))?;

        info!(db_url = %config.database.url, "Initializing database...");
        let pool = create_pool(&config.database.url)
            .await
            .map_err(|e| anyhow::anyhow!("DB pool creation failed: {}", e))?;
        run_migrations(&pool)
            .await
            .map_err(|e| anyhow::anyhow!("Migration failed: {}", e))?;

        let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
        let id_provider: Arc<dyn IdProvider> = Arc::new(UuidProvider);

        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(pool.clone()));
        let jobs: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(pool.clone()));
        let station_repository = Arc::new(SqliteStationRepository::new(pool));
        let blobs = Arc::new(LocalBlobStore::new(
            config.blob.root.clone(),
            &config.blob.allowed_extensions,
            time_provider.clone(),
        ));

        let bus = BroadcastEventBus::new(config.jobs.bus_capacity);
        let publisher: Arc<dyn IntegrationEventPublisher> = Arc::new(bus.clone());
        let dispatcher = Arc::new(default_dispatcher(
            publisher,
            id_provider.clone(),
            time_provider.clone(),
        ));
        let protections = Arc::new(default_registry(store.clone())?);

        let scheduler: Arc<dyn JobScheduler> = Arc::new(QueueJobScheduler::new(
            jobs.clone(),
            id_provider.clone(),
            time_provider.clone(),
            config.jobs.queue.clone(),
        ));

        let cards = Arc::new(CardService::new(
            store.clone(),
            dispatcher.clone(),
            protections.clone(),
            id_provider.clone(),
            time_provider.clone(),
        ));
        let imports = Arc::new(ImportHistoryService::new(
            store.clone(),
            dispatcher.clone(),
            protections,
            blobs.clone(),
            id_provider.clone(),
            time_provider.clone(),
            config.import_settings(),
        ));
        let lifecycle = Arc::new(BatchLifecycle::new(
            store,
            dispatcher,
            scheduler.clone(),
            blobs,
            Arc::new(CsvHistoryInspector::new()),
            time_provider.clone(),
            config.lifecycle_settings(),
        ));
        let stations = Arc::new(StationSyncService::new(
            Arc::new(HttpStationSource::new(&config.stations.base_url)?),
            station_repository,
            id_provider.clone(),
            time_provider.clone(),
        ));
        let commands = Arc::new(CommandDispatcher::new(
            cards.clone(),
            lifecycle,
            stations,
            time_provider.clone(),
        ));

        Ok(Self {
            config,
            time_provider,
            id_provider,
            jobs,
            bus,
            scheduler,
            cards,
            imports,
            commands,
        })
    }

    /// Start feeding created batches to the queueing consumer
    ///
    /// Subscribes before returning, so events published afterwards are never missed.
    pub fn spawn_consumer(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let consumer = Arc::new(ImportBatchCreatedConsumer::new(self.scheduler.clone()));
        tokio::spawn(BroadcastEventBus::consume(
            self.bus.subscribe(),
            consumer,
            shutdown,
        ))
    }

    pub fn worker(&self) -> Worker {
        Worker::new(
            self.config.worker_settings(),
            self.jobs.clone(),
            self.commands.clone(),
            Arc::new(RetryPolicy::default()),
            self.id_provider.clone(),
            self.time_provider.clone(),
        )
    }

    pub async fn recover(&self) -> usize {
        let recovery = RecoveryService::new(self.jobs.clone(), self.time_provider.clone(), None);
        match recovery.recover_orphaned_jobs().await {
            Ok(count) => {
                info!(recovered_jobs = count, "Crash recovery completed");
                count
            }
            Err(e) => {
                tracing::error!(error = ?e, "Crash recovery failed");
                0
            }
        }
    }

    pub async fn schedule_maintenance(&self) -> Result<()> {
        self.scheduler
            .schedule_recurring(
                CARD_CLEANUP_JOB,
                BackgroundCommand::DeleteExpiredCards,
                &self.config.jobs.card_cleanup_cron,
            )
            .await?;
        self.scheduler
            .schedule_recurring(
                BLOB_SWEEP_JOB,
                BackgroundCommand::SweepOrphanBlobs,
                &self.config.jobs.blob_sweep_cron,
            )
            .await?;
        self.scheduler
            .schedule_recurring(
                STALLED_BATCH_JOB,
                BackgroundCommand::RequeueStalledBatches,
                &self.config.jobs.stalled_batch_cron,
            )
            .await?;
        self.scheduler
            .schedule_recurring(
                STATION_SYNC_JOB,
                BackgroundCommand::SyncStations,
                &self.config.stations.sync_cron,
            )
            .await?;
        info!(
            card_cleanup = %self.config.jobs.card_cleanup_cron,
            blob_sweep = %self.config.jobs.blob_sweep_cron,
            stalled_batches = %self.config.jobs.stalled_batch_cron,
            station_sync = %self.config.stations.sync_cron,
            "Maintenance schedules registered"
        );
        Ok(())
    }
}
