//! Shared harness: the real SQLite and filesystem adapters wired like the daemon,
//! with a controllable clock and manual event delivery.

#![allow(dead_code)]

use chrono::{NaiveDate, Utc};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use transit_core::application::{
    default_dispatcher, BatchLifecycle, CardRequest, CardService, CommandDispatcher,
    ImportBatchCreatedConsumer, ImportContent, ImportHistoryRequest, ImportHistoryResponse,
    ImportHistoryService, ImportSettings, LifecycleSettings, QueueJobScheduler, RetryPolicy,
    StationSyncService, Worker, WorkerSettings,
};
use transit_core::domain::{Card, CardType, ImportBatch};
use transit_core::error::Result;
use transit_core::port::id_provider::UuidProvider;
use transit_core::port::station_source::mocks::StaticStationSource;
use transit_core::port::time_provider::mocks::FixedTimeProvider;
use transit_core::port::{
    ClaimsIdentity, EntityStore, IntegrationEvent, IntegrationEventHandler, JobQueue,
    JobScheduler,
};
use transit_core::repository::protections::default_registry;
use transit_core::repository::{ProtectionRegistry, QueryRepo};
use transit_infra_sqlite::{
    create_pool, run_migrations, SqliteEntityStore, SqliteJobQueue, SqliteStationRepository,
};
use transit_infra_system::{BroadcastEventBus, CsvHistoryInspector, LocalBlobStore};
use uuid::Uuid;

pub const HEADER: &str = "Sequence Number,Transaction Date,Site,Transaction Type,Remaining Trips,Transaction Value,PAYG Balance";

pub fn history_csv(rows: &[&str]) -> String {
    let mut csv = String::from(HEADER);
    for row in rows {
        csv.push('\n');
        csv.push_str(row);
    }
    csv.push('\n');
    csv
}

pub struct Harness {
    pub time: Arc<FixedTimeProvider>,
    pub store: Arc<dyn EntityStore>,
    pub jobs: Arc<dyn JobQueue>,
    pub blobs: Arc<LocalBlobStore>,
    pub scheduler: Arc<dyn JobScheduler>,
    pub protections: Arc<ProtectionRegistry>,
    pub cards: Arc<CardService>,
    pub imports: ImportHistoryService,
    pub commands: Arc<CommandDispatcher>,
    pub station_source: Arc<StaticStationSource>,
    pub station_repository: Arc<SqliteStationRepository>,
    pub worker: Worker,
    consumer: ImportBatchCreatedConsumer,
    events: Mutex<broadcast::Receiver<IntegrationEvent>>,
    _blob_root: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        Self::with_pool(pool).await
    }

    pub async fn with_pool(pool: sqlx::SqlitePool) -> Self {
        let blob_root = tempfile::tempdir().unwrap();
        let time = Arc::new(FixedTimeProvider::new(Utc::now()));
        let id_provider = Arc::new(UuidProvider);

        let store: Arc<dyn EntityStore> = Arc::new(SqliteEntityStore::new(pool.clone()));
        let jobs: Arc<dyn JobQueue> = Arc::new(SqliteJobQueue::new(pool.clone()));
        let station_repository = Arc::new(SqliteStationRepository::new(pool));
        let station_source = Arc::new(StaticStationSource::default());
        let blobs = Arc::new(LocalBlobStore::new(
            blob_root.path(),
            &[".csv".to_string()],
            time.clone(),
        ));

        let bus = BroadcastEventBus::new(64);
        let events = bus.subscribe();
        let dispatcher = Arc::new(default_dispatcher(
            Arc::new(bus),
            id_provider.clone(),
            time.clone(),
        ));
        let protections = Arc::new(default_registry(store.clone()).unwrap());

        let scheduler: Arc<dyn JobScheduler> = Arc::new(QueueJobScheduler::new(
            jobs.clone(),
            id_provider.clone(),
            time.clone(),
            "default",
        ));
        let cards = Arc::new(CardService::new(
            store.clone(),
            dispatcher.clone(),
            protections.clone(),
            id_provider.clone(),
            time.clone(),
        ));
        let imports = ImportHistoryService::new(
            store.clone(),
            dispatcher.clone(),
            protections.clone(),
            blobs.clone(),
            id_provider.clone(),
            time.clone(),
            ImportSettings::default(),
        );
        let lifecycle = Arc::new(BatchLifecycle::new(
            store.clone(),
            dispatcher,
            scheduler.clone(),
            blobs.clone(),
            Arc::new(CsvHistoryInspector::new()),
            time.clone(),
            LifecycleSettings::default(),
        ));
        let stations = Arc::new(StationSyncService::new(
            station_source.clone(),
            station_repository.clone(),
            id_provider.clone(),
            time.clone(),
        ));
        let commands = Arc::new(CommandDispatcher::new(
            cards.clone(),
            lifecycle,
            stations,
            time.clone(),
        ));
        let worker = Worker::new(
            WorkerSettings::default(),
            jobs.clone(),
            commands.clone(),
            Arc::new(RetryPolicy::default()),
            id_provider,
            time.clone(),
        );

        Self {
            time,
            store,
            jobs,
            blobs,
            consumer: ImportBatchCreatedConsumer::new(scheduler.clone()),
            scheduler,
            protections,
            cards,
            imports,
            commands,
            station_source,
            station_repository,
            worker,
            events: Mutex::new(events),
            _blob_root: blob_root,
        }
    }

    pub fn identity(user: Uuid) -> Arc<ClaimsIdentity> {
        Arc::new(ClaimsIdentity::for_user(user, &[]))
    }

    pub async fn add_card(&self, user: Uuid, number: &str) -> Card {
        self.cards
            .create(
                Self::identity(user),
                CardRequest {
                    alias: format!("Card {}", number),
                    number: number.to_string(),
                    card_type: CardType::Silver,
                    expiry_date: NaiveDate::from_ymd_opt(2099, 12, 31).unwrap(),
                },
            )
            .await
            .unwrap()
    }

    pub async fn import(
        &self,
        user: Uuid,
        card_id: Uuid,
        file_name: &str,
        content: &str,
    ) -> Result<ImportHistoryResponse> {
        self.imports
            .import(
                Self::identity(user),
                ImportHistoryRequest {
                    card_id,
                    file_name: file_name.to_string(),
                    content_type: "text/csv".to_string(),
                    content: ImportContent::Seekable(Box::new(Cursor::new(
                        content.as_bytes().to_vec(),
                    ))),
                },
                &CancellationToken::new(),
            )
            .await
    }

    /// Hand every published integration event to the queueing consumer
    pub async fn deliver_events(&self) -> usize {
        let pending: Vec<IntegrationEvent> = {
            let mut receiver = self.events.lock().unwrap();
            std::iter::from_fn(|| receiver.try_recv().ok()).collect()
        };
        for event in &pending {
            self.consumer.handle(event).await.unwrap();
        }
        pending.len()
    }

    /// Drop every published integration event, as if the bus lost them
    pub fn discard_events(&self) -> usize {
        let mut receiver = self.events.lock().unwrap();
        std::iter::from_fn(|| receiver.try_recv().ok()).count()
    }

    /// Process due jobs until the queue has nothing runnable
    pub async fn run_jobs(&self) -> usize {
        let mut processed = 0;
        while self.worker.process_next_job().await.unwrap() {
            processed += 1;
        }
        processed
    }

    pub async fn batch(&self, id: Uuid) -> Option<ImportBatch> {
        QueryRepo::new(self.store.clone())
            .find::<ImportBatch>(id)
            .await
            .unwrap()
    }
}
