// Import Batch Lifecycle - what happens to a batch after its upload commits
//
// created event -> QueueImportBatch -> ProcessImportBatch -> Completed | Failed
// RequeueStalledBatches picks up batches whose created event was lost

use crate::application::events::DomainEventDispatcher;
use crate::application::import_history::IMPORT_CONTAINER;
use crate::domain::{BackgroundCommand, ImportBatch, JobStatus};
use crate::error::{AppError, Result};
use crate::port::entity_store::fields;
use crate::port::{
    BatchProcessor, BlobError, BlobStore, EntityStore, FieldValue, IntegrationEvent,
    IntegrationEventHandler, IntegrationPayload, JobScheduler, TimeProvider,
};
use crate::repository::{CommandRepo, Persist, QueryRepo};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const DEFAULT_MAX_PROCESSING_ATTEMPTS: i32 = 3;

/// Blobs younger than this are never swept (1 hour)
pub const DEFAULT_ORPHAN_BLOB_GRACE: Duration = Duration::from_secs(60 * 60);

/// Uploads still unqueued after this long are requeued by the stalled batch sweep (10 minutes)
pub const DEFAULT_STALLED_BATCH_AGE: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub container: String,
    pub max_processing_attempts: i32,
    pub orphan_blob_grace: Duration,
    pub stalled_batch_age: Duration,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            container: IMPORT_CONTAINER.to_string(),
            max_processing_attempts: DEFAULT_MAX_PROCESSING_ATTEMPTS,
            orphan_blob_grace: DEFAULT_ORPHAN_BLOB_GRACE,
            stalled_batch_age: DEFAULT_STALLED_BATCH_AGE,
        }
    }
}

/// Bus consumer: every created batch gets a queueing job
pub struct ImportBatchCreatedConsumer {
    scheduler: Arc<dyn JobScheduler>,
}

impl ImportBatchCreatedConsumer {
    pub fn new(scheduler: Arc<dyn JobScheduler>) -> Self {
        Self { scheduler }
    }
}

#[async_trait]
impl IntegrationEventHandler for ImportBatchCreatedConsumer {
    async fn handle(&self, event: &IntegrationEvent) -> Result<()> {
        let IntegrationPayload::ImportBatchCreated { import_batch_id } = event.payload;
        let job_id = self
            .scheduler
            .enqueue(BackgroundCommand::QueueImportBatch {
                batch_id: import_batch_id,
            })
            .await?;

        info!(
            event_id = %event.id,
            batch_id = %import_batch_id,
            job_id = %job_id,
            "Queued import batch for processing"
        );
        Ok(())
    }
}

pub struct BatchLifecycle {
    store: Arc<dyn EntityStore>,
    dispatcher: Arc<DomainEventDispatcher>,
    scheduler: Arc<dyn JobScheduler>,
    blobs: Arc<dyn BlobStore>,
    processor: Arc<dyn BatchProcessor>,
    time_provider: Arc<dyn TimeProvider>,
    settings: LifecycleSettings,
}

impl BatchLifecycle {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Arc<DomainEventDispatcher>,
        scheduler: Arc<dyn JobScheduler>,
        blobs: Arc<dyn BlobStore>,
        processor: Arc<dyn BatchProcessor>,
        time_provider: Arc<dyn TimeProvider>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            store,
            dispatcher,
            scheduler,
            blobs,
            processor,
            time_provider,
            settings,
        }
    }

    /// Move an uploaded batch to `Queued` and hand it to a processing job
    ///
    /// Safe to run again: a queued batch without a job id resumes at the enqueue
    /// step, anything further along is left alone.
    pub async fn queue_batch(&self, batch_id: Uuid) -> Result<()> {
        let Some(mut batch) = self.load(batch_id).await? else {
            warn!(batch_id = %batch_id, "Batch no longer exists, nothing to queue");
            return Ok(());
        };

        match batch.status() {
            JobStatus::Uploaded => {
                batch.transition(JobStatus::Queued, self.time_provider.now())?;
                batch = self.save(batch).await?;
            }
            JobStatus::Queued if batch.hangfire_job_id().is_none() => {}
            status => {
                info!(batch_id = %batch_id, status = %status, "Batch already queued, skipping");
                return Ok(());
            }
        }

        let job_id = self
            .scheduler
            .enqueue(BackgroundCommand::ProcessImportBatch { batch_id })
            .await?;
        batch.set_hangfire_job_id(&job_id)?;
        self.save(batch).await?;

        info!(batch_id = %batch_id, job_id = %job_id, "Batch queued");
        Ok(())
    }

    /// Queue batches whose created event never reached the consumer
    ///
    /// Picks up batches uploaded more than `stalled_batch_age` ago that are still
    /// `Uploaded`, or `Queued` without a processing job. Returns how many were queued.
    pub async fn requeue_stalled_batches(&self) -> Result<usize> {
        let age = chrono::Duration::from_std(self.settings.stalled_batch_age)
            .map_err(|e| AppError::Config(format!("Invalid stalled batch age: {}", e)))?;
        let cutoff = self.time_provider.now() - age;

        let queries = QueryRepo::new(self.store.clone());
        let uploaded = queries
            .queryable::<ImportBatch>()
            .filter_eq(fields::import_batch::STATUS, JobStatus::Uploaded.as_i32())
            .filter_lt(fields::import_batch::UPLOADED_AT, cutoff);
        let unassigned = queries
            .queryable::<ImportBatch>()
            .filter_eq(fields::import_batch::STATUS, JobStatus::Queued.as_i32())
            .filter_eq(fields::import_batch::HANGFIRE_JOB_ID, FieldValue::Null)
            .filter_lt(fields::import_batch::UPLOADED_AT, cutoff);

        let mut stalled = queries.list(&uploaded).await?;
        stalled.extend(queries.list(&unassigned).await?);

        let mut requeued = 0;
        for batch in stalled {
            match self.queue_batch(batch.id()).await {
                Ok(()) => requeued += 1,
                // The consumer got there between the read and the write
                Err(AppError::Concurrency(_)) => {
                    info!(batch_id = %batch.id(), "Stalled batch was queued concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        if requeued > 0 {
            warn!(requeued = requeued, "Requeued stalled import batches");
        }
        Ok(requeued)
    }

    /// Run the batch processor over the uploaded file
    ///
    /// A retryable failure is recorded on the batch and returned as an error until
    /// `max_processing_attempts` is reached; then the batch becomes `Failed`. Any
    /// other processor error fails the batch on the spot.
    pub async fn process_batch(&self, batch_id: Uuid) -> Result<()> {
        let Some(mut batch) = self.load(batch_id).await? else {
            warn!(batch_id = %batch_id, "Batch no longer exists, nothing to process");
            return Ok(());
        };

        if batch.is_terminal() {
            info!(batch_id = %batch_id, status = %batch.status(), "Batch is terminal, skipping");
            return Ok(());
        }
        match batch.status() {
            JobStatus::Queued => {
                batch.transition(JobStatus::Processing, self.time_provider.now())?;
                batch = self.save(batch).await?;
            }
            JobStatus::Processing => {}
            status => {
                return Err(AppError::Execution(format!(
                    "Batch {} is {} and cannot be processed yet",
                    batch_id, status
                )));
            }
        }

        let content = match self.read_blob(&batch).await {
            Ok(content) => content,
            Err(AppError::Blob(BlobError::NotFound { .. })) => {
                let message = format!("Uploaded file {} is missing", batch.blob_name());
                error!(batch_id = %batch_id, blob_name = %batch.blob_name(), "Uploaded file is missing");
                batch.set_error(Some(&message));
                batch.transition(JobStatus::Failed, self.time_provider.now())?;
                self.save(batch).await?;
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match self.processor.process(&batch, content).await {
            Ok(flags) => {
                batch.add_outcome_flags(flags);
                batch.clear_error();
                batch.transition(JobStatus::Completed, self.time_provider.now())?;
                self.save(batch).await?;
                info!(batch_id = %batch_id, outcome_flags = flags.bits(), "Batch completed");
                Ok(())
            }
            Err(e) => {
                batch.set_error(Some(&e.to_string()));
                batch.increment_retry();
                let attempts = batch.retry_count();

                if !e.is_retryable() {
                    batch.transition(JobStatus::Failed, self.time_provider.now())?;
                    self.save(batch).await?;
                    error!(batch_id = %batch_id, error = %e, "Batch rejected by processor");
                    return Ok(());
                }

                if attempts >= self.settings.max_processing_attempts {
                    batch.transition(JobStatus::Failed, self.time_provider.now())?;
                    self.save(batch).await?;
                    error!(
                        batch_id = %batch_id,
                        attempts = attempts,
                        error = %e,
                        "Batch failed permanently"
                    );
                    return Ok(());
                }

                self.save(batch).await?;
                warn!(batch_id = %batch_id, attempts = attempts, error = %e, "Batch processing failed");
                Err(AppError::Execution(format!(
                    "Processing batch {} failed: {}",
                    batch_id, e
                )))
            }
        }
    }

    /// Fail a batch whose processing job gave up before the processor could
    ///
    /// Batches that are terminal or were never queued are left alone.
    pub async fn fail_batch(&self, batch_id: Uuid, reason: &str) -> Result<()> {
        let Some(mut batch) = self.load(batch_id).await? else {
            return Ok(());
        };
        let now = self.time_provider.now();

        match batch.status() {
            // Failed is only reachable from Processing
            JobStatus::Queued => batch.transition(JobStatus::Processing, now)?,
            JobStatus::Processing => {}
            status => {
                info!(batch_id = %batch_id, status = %status, "Batch not in flight, nothing to fail");
                return Ok(());
            }
        }

        batch.set_error(Some(reason));
        batch.transition(JobStatus::Failed, now)?;
        self.save(batch).await?;
        error!(batch_id = %batch_id, error = %reason, "Batch failed after its job gave up");
        Ok(())
    }

    /// Delete uploaded blobs that no batch references once they are past the grace period
    ///
    /// Leftovers of uploads that never finished go after the same grace period.
    /// Returns how many blobs and leftovers were removed.
    pub async fn sweep_orphan_blobs(&self) -> Result<usize> {
        let container = self.settings.container.as_str();
        let grace = chrono::Duration::from_std(self.settings.orphan_blob_grace)
            .map_err(|e| AppError::Config(format!("Invalid orphan blob grace period: {}", e)))?;
        let cutoff = self.time_provider.now() - grace;

        let queries = QueryRepo::new(self.store.clone());
        let mut removed = 0;
        for blob in self.blobs.list(container).await? {
            if blob.last_modified >= cutoff {
                continue;
            }
            let referenced = queries
                .queryable::<ImportBatch>()
                .filter_eq(fields::import_batch::BLOB_CONTAINER, container)
                .filter_eq(fields::import_batch::BLOB_NAME, blob.name.clone());
            if queries.exists(&referenced).await? {
                continue;
            }
            if self.blobs.delete(&blob.name, container).await? {
                info!(blob_name = %blob.name, "Deleted orphan blob");
                removed += 1;
            }
        }

        let unfinished = self.blobs.purge_incomplete(container, cutoff).await?;
        if unfinished > 0 {
            info!(removed = unfinished, container = %container, "Removed unfinished uploads");
        }

        let removed = removed + unfinished;
        if removed > 0 {
            info!(removed = removed, container = %container, "Orphan blob sweep complete");
        }
        Ok(removed)
    }

    async fn load(&self, batch_id: Uuid) -> Result<Option<ImportBatch>> {
        QueryRepo::new(self.store.clone()).find::<ImportBatch>(batch_id).await
    }

    /// Persist and return the stored copy, which carries the new version
    async fn save(&self, batch: ImportBatch) -> Result<ImportBatch> {
        let id = batch.id();
        let mut commands = CommandRepo::new(self.store.clone(), self.dispatcher.clone());
        commands.update(batch, Persist::Immediately).await?;
        self.load(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Import batch {} does not exist.", id)))
    }

    async fn read_blob(&self, batch: &ImportBatch) -> Result<Vec<u8>> {
        let mut reader = self
            .blobs
            .download(batch.blob_name(), batch.blob_container())
            .await?;
        let mut content = Vec::new();
        reader.read_to_end(&mut content).await?;
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::scheduler::QueueJobScheduler;
    use crate::domain::{Card, CardType, OutcomeFlags};
    use crate::port::batch_processor::mocks::StaticProcessor;
    use crate::port::blob_store::mocks::InMemoryBlobStore;
    use crate::port::entity_store::mocks::InMemoryEntityStore;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::job_queue::mocks::InMemoryJobQueue;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use crate::port::{EntityRecord, EntityTable};
    use chrono::{NaiveDate, Utc};

    struct Fixture {
        store: Arc<InMemoryEntityStore>,
        jobs: Arc<InMemoryJobQueue>,
        blobs: Arc<InMemoryBlobStore>,
        processor: Arc<StaticProcessor>,
        time: Arc<FixedTimeProvider>,
        lifecycle: BatchLifecycle,
        batch_id: Uuid,
    }

    fn fixture(processor: StaticProcessor) -> Fixture {
        let store = Arc::new(InMemoryEntityStore::new());
        let jobs = Arc::new(InMemoryJobQueue::new());
        let blobs = Arc::new(InMemoryBlobStore::new());
        let processor = Arc::new(processor);
        let time = Arc::new(FixedTimeProvider::new(Utc::now()));

        let card = Card::create(
            Uuid::now_v7(),
            Uuid::now_v7(),
            "Work",
            "42",
            CardType::Gold,
            NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            Utc::now(),
        )
        .unwrap();
        let batch = ImportBatch::create(
            Uuid::now_v7(),
            card.id,
            IMPORT_CONTAINER,
            "history.csv",
            "9A".repeat(32),
            Utc::now(),
        )
        .unwrap();
        let batch_id = batch.id();
        store.seed(EntityRecord::Card(card));
        store.seed(EntityRecord::ImportBatch(batch));
        blobs.put(IMPORT_CONTAINER, "history.csv", b"a,b\n", Utc::now());

        let scheduler = Arc::new(QueueJobScheduler::new(
            jobs.clone(),
            Arc::new(SequentialIdProvider::new()),
            time.clone(),
            "default",
        ));
        let lifecycle = BatchLifecycle::new(
            store.clone(),
            Arc::new(DomainEventDispatcher::new()),
            scheduler,
            blobs.clone(),
            processor.clone(),
            time.clone(),
            LifecycleSettings::default(),
        );

        Fixture {
            store,
            jobs,
            blobs,
            processor,
            time,
            lifecycle,
            batch_id,
        }
    }

    async fn batch(f: &Fixture) -> ImportBatch {
        f.lifecycle.load(f.batch_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_queue_batch_enqueues_processing_once() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));

        f.lifecycle.queue_batch(f.batch_id).await.unwrap();
        f.lifecycle.queue_batch(f.batch_id).await.unwrap();

        let queued = batch(&f).await;
        assert_eq!(queued.status(), JobStatus::Queued);
        assert!(queued.queued_at().is_some());

        let jobs = f.jobs.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(queued.hangfire_job_id(), Some(jobs[0].id.as_str()));
        assert_eq!(
            jobs[0].command,
            BackgroundCommand::ProcessImportBatch { batch_id: f.batch_id }
        );
    }

    #[tokio::test]
    async fn test_process_batch_completes_with_flags() {
        let flags = OutcomeFlags::UNKNOWN_SITES | OutcomeFlags::PARTIAL_SUCCEEDED;
        let f = fixture(StaticProcessor::succeeding(flags));

        f.lifecycle.queue_batch(f.batch_id).await.unwrap();
        f.lifecycle.process_batch(f.batch_id).await.unwrap();

        let done = batch(&f).await;
        assert_eq!(done.status(), JobStatus::Completed);
        assert_eq!(done.outcome_flags(), flags);
        assert!(done.started_at().is_some());
        assert!(done.completed_at().is_some());

        f.lifecycle.process_batch(f.batch_id).await.unwrap();
        assert_eq!(f.processor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_processing_failures_end_in_failed() {
        let f = fixture(StaticProcessor::failing("header missing"));
        f.lifecycle.queue_batch(f.batch_id).await.unwrap();

        for attempt in 1..DEFAULT_MAX_PROCESSING_ATTEMPTS {
            let err = f.lifecycle.process_batch(f.batch_id).await.unwrap_err();
            assert!(err.is_retryable());
            let current = batch(&f).await;
            assert_eq!(current.status(), JobStatus::Processing);
            assert_eq!(current.retry_count(), attempt);
        }

        f.lifecycle.process_batch(f.batch_id).await.unwrap();
        let failed = batch(&f).await;
        assert_eq!(failed.status(), JobStatus::Failed);
        assert!(failed.error().unwrap().contains("header missing"));
    }

    #[tokio::test]
    async fn test_rejected_file_fails_without_retry() {
        let f = fixture(StaticProcessor::rejecting("Travel history header is missing columns"));
        f.lifecycle.queue_batch(f.batch_id).await.unwrap();

        f.lifecycle.process_batch(f.batch_id).await.unwrap();

        let failed = batch(&f).await;
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.retry_count(), 1);
        assert!(failed.failed_at().is_some());
        assert!(failed.error().unwrap().contains("header is missing"));
        assert_eq!(f.processor.call_count(), 1);
    }

    #[tokio::test]
    async fn test_storage_errors_leave_batch_for_retry_then_fail_batch() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        f.blobs.fail_downloads(true);
        f.lifecycle.queue_batch(f.batch_id).await.unwrap();

        let err = f.lifecycle.process_batch(f.batch_id).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(batch(&f).await.status(), JobStatus::Processing);
        assert_eq!(batch(&f).await.retry_count(), 0);

        f.lifecycle
            .fail_batch(f.batch_id, "Blob storage error: download rejected")
            .await
            .unwrap();
        let failed = batch(&f).await;
        assert_eq!(failed.status(), JobStatus::Failed);
        assert_eq!(failed.error(), Some("Blob storage error: download rejected"));

        // Already terminal
        f.lifecycle.fail_batch(f.batch_id, "again").await.unwrap();
        assert_eq!(batch(&f).await.error(), Some("Blob storage error: download rejected"));
    }

    #[tokio::test]
    async fn test_fail_batch_ignores_unqueued_batch() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        f.lifecycle.fail_batch(f.batch_id, "gave up").await.unwrap();
        assert_eq!(batch(&f).await.status(), JobStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_stalled_uploads_are_requeued() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));

        // Too recent to tell apart from an event still in flight
        assert_eq!(f.lifecycle.requeue_stalled_batches().await.unwrap(), 0);
        assert!(f.jobs.all_jobs().is_empty());

        f.time.advance(chrono::Duration::minutes(11));
        assert_eq!(f.lifecycle.requeue_stalled_batches().await.unwrap(), 1);

        let queued = batch(&f).await;
        assert_eq!(queued.status(), JobStatus::Queued);
        let jobs = f.jobs.all_jobs();
        assert_eq!(jobs.len(), 1);
        assert_eq!(queued.hangfire_job_id(), Some(jobs[0].id.as_str()));

        // Nothing left to pick up
        assert_eq!(f.lifecycle.requeue_stalled_batches().await.unwrap(), 0);
        assert_eq!(f.jobs.all_jobs().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_blob_fails_batch() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        f.blobs.delete("history.csv", IMPORT_CONTAINER).await.unwrap();
        f.lifecycle.queue_batch(f.batch_id).await.unwrap();

        f.lifecycle.process_batch(f.batch_id).await.unwrap();
        assert_eq!(batch(&f).await.status(), JobStatus::Failed);
        assert_eq!(f.processor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unqueued_batch_is_not_processed() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        let err = f.lifecycle.process_batch(f.batch_id).await.unwrap_err();
        assert!(matches!(err, AppError::Execution(_)));
        assert_eq!(batch(&f).await.status(), JobStatus::Uploaded);
    }

    #[tokio::test]
    async fn test_sweep_keeps_referenced_and_recent_blobs() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        let old = f.time.now() - chrono::Duration::hours(2);
        f.blobs.put(IMPORT_CONTAINER, "history.csv", b"a,b\n", old);
        f.blobs.put(IMPORT_CONTAINER, "orphan.csv", b"x", old);
        f.blobs.put(IMPORT_CONTAINER, "fresh.csv", b"y", f.time.now());

        assert_eq!(f.lifecycle.sweep_orphan_blobs().await.unwrap(), 1);
        assert!(f.blobs.get(IMPORT_CONTAINER, "orphan.csv").is_none());
        assert!(f.blobs.get(IMPORT_CONTAINER, "history.csv").is_some());
        assert!(f.blobs.get(IMPORT_CONTAINER, "fresh.csv").is_some());
        assert_eq!(f.store.row_count(EntityTable::ImportBatches), 1);
    }

    #[tokio::test]
    async fn test_sweep_removes_stale_unfinished_uploads() {
        let f = fixture(StaticProcessor::succeeding(OutcomeFlags::NONE));
        let old = f.time.now() - chrono::Duration::hours(2);
        f.blobs.put_incomplete(IMPORT_CONTAINER, "cancelled.csv.partial", old);
        f.blobs.put_incomplete(IMPORT_CONTAINER, "uploading.csv.partial", f.time.now());

        assert_eq!(f.lifecycle.sweep_orphan_blobs().await.unwrap(), 1);
        assert_eq!(f.blobs.incomplete_count(), 1);
        assert!(f.blobs.get(IMPORT_CONTAINER, "history.csv").is_some());
    }

    #[tokio::test]
    async fn test_consumer_enqueues_queue_command() {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let scheduler = Arc::new(QueueJobScheduler::new(
            jobs.clone(),
            Arc::new(SequentialIdProvider::new()),
            Arc::new(FixedTimeProvider::new(Utc::now())),
            "default",
        ));
        let consumer = ImportBatchCreatedConsumer::new(scheduler);
        let batch_id = Uuid::now_v7();

        consumer
            .handle(&IntegrationEvent::new(
                Uuid::now_v7(),
                Utc::now(),
                IntegrationPayload::ImportBatchCreated {
                    import_batch_id: batch_id,
                },
            ))
            .await
            .unwrap();

        assert_eq!(
            jobs.all_jobs()[0].command,
            BackgroundCommand::QueueImportBatch { batch_id }
        );
    }
}
