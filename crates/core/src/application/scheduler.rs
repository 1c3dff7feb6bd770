// Job Scheduler - queue-backed implementation of the scheduler port

use crate::domain::{BackgroundCommand, BackgroundJob, JobId, RecurringJob};
use crate::error::{AppError, Result};
use crate::port::{IdProvider, JobQueue, JobScheduler, TimeProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Parse a cron expression, accepting the 5-field form without seconds
pub fn parse_cron(expression: &str) -> Result<Schedule> {
    let trimmed = expression.trim();
    let normalized = if trimmed.split_whitespace().count() == 5 {
        format!("0 {}", trimmed)
    } else {
        trimmed.to_string()
    };

    Schedule::from_str(&normalized).map_err(|e| {
        AppError::Validation(format!("Invalid cron expression '{}': {}", expression, e))
    })
}

/// First fire time strictly after `after`, in epoch ms
pub fn next_occurrence(schedule: &Schedule, after: DateTime<Utc>) -> Option<i64> {
    schedule.after(&after).next().map(|t| t.timestamp_millis())
}

pub struct QueueJobScheduler {
    jobs: Arc<dyn JobQueue>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
    queue: String,
}

impl QueueJobScheduler {
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            id_provider,
            time_provider,
            queue: queue.into(),
        }
    }
}

#[async_trait]
impl JobScheduler for QueueJobScheduler {
    async fn enqueue(&self, command: BackgroundCommand) -> Result<JobId> {
        self.schedule(command, Duration::ZERO).await
    }

    async fn schedule(&self, command: BackgroundCommand, delay: Duration) -> Result<JobId> {
        let now = self.time_provider.now_millis();
        let delay_ms = i64::try_from(delay.as_millis())
            .map_err(|_| AppError::Validation(format!("Delay {:?} is too large", delay)))?;

        let id = self.id_provider.generate_id().to_string();
        let job = BackgroundJob::new(id.clone(), now, self.queue.clone(), command)
            .with_run_at(now.saturating_add(delay_ms));
        self.jobs.insert(&job).await?;

        info!(
            job_id = %id,
            command = job.command.name(),
            queue = %self.queue,
            delay_ms = delay_ms,
            "Job enqueued"
        );
        Ok(id)
    }

    async fn schedule_recurring(
        &self,
        recurring_id: &str,
        command: BackgroundCommand,
        cron: &str,
    ) -> Result<()> {
        if recurring_id.trim().is_empty() {
            return Err(AppError::Validation("Recurring job id cannot be empty.".to_string()));
        }
        let schedule = parse_cron(cron)?;
        let next_run_at = next_occurrence(&schedule, self.time_provider.now()).ok_or_else(|| {
            AppError::Validation(format!("Cron expression '{}' never fires", cron))
        })?;

        let job = RecurringJob {
            id: recurring_id.to_string(),
            queue: self.queue.clone(),
            command,
            cron: cron.trim().to_string(),
            next_run_at,
            last_run_at: None,
        };
        self.jobs.upsert_recurring(&job).await?;

        info!(
            recurring_id = %recurring_id,
            command = job.command.name(),
            cron = %job.cron,
            next_run_at = next_run_at,
            "Recurring job scheduled"
        );
        Ok(())
    }

    async fn remove_recurring(&self, recurring_id: &str) -> Result<bool> {
        self.jobs.remove_recurring(recurring_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::BackgroundJobState;
    use crate::port::id_provider::mocks::SequentialIdProvider;
    use crate::port::job_queue::mocks::InMemoryJobQueue;
    use crate::port::time_provider::mocks::FixedTimeProvider;
    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    fn setup() -> (Arc<InMemoryJobQueue>, QueueJobScheduler, DateTime<Utc>) {
        let jobs = Arc::new(InMemoryJobQueue::new());
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
        let scheduler = QueueJobScheduler::new(
            jobs.clone(),
            Arc::new(SequentialIdProvider::new()),
            Arc::new(FixedTimeProvider::new(now)),
            "default",
        );
        (jobs, scheduler, now)
    }

    #[tokio::test]
    async fn test_enqueue_and_schedule() {
        let (jobs, scheduler, now) = setup();

        let first = assert_ok!(scheduler.enqueue(BackgroundCommand::DeleteExpiredCards).await);
        let second = assert_ok!(
            scheduler
                .schedule(BackgroundCommand::SweepOrphanBlobs, Duration::from_secs(60))
                .await
        );
        assert_ne!(first, second);

        let stored = jobs.all_jobs();
        assert_eq!(stored.len(), 2);
        let delayed = stored.iter().find(|j| j.id == second).unwrap();
        assert_eq!(delayed.state, BackgroundJobState::Enqueued);
        assert_eq!(delayed.run_at, now.timestamp_millis() + 60_000);
    }

    #[tokio::test]
    async fn test_recurring_upsert_and_remove() {
        let (jobs, scheduler, now) = setup();

        scheduler
            .schedule_recurring("cleanup", BackgroundCommand::DeleteExpiredCards, "0 0 * * *")
            .await
            .unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        assert_eq!(jobs.recurring("cleanup").unwrap().next_run_at, midnight.timestamp_millis());

        scheduler
            .schedule_recurring("cleanup", BackgroundCommand::DeleteExpiredCards, "0 0 * * * *")
            .await
            .unwrap();
        let next_hour = Utc.with_ymd_and_hms(2024, 5, 1, 11, 0, 0).unwrap();
        assert!(now < next_hour);
        assert_eq!(jobs.recurring("cleanup").unwrap().next_run_at, next_hour.timestamp_millis());

        assert!(scheduler.remove_recurring("cleanup").await.unwrap());
        assert!(!scheduler.remove_recurring("cleanup").await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_cron_is_validation_error() {
        let (_, scheduler, _) = setup();
        let err = assert_err!(
            scheduler
                .schedule_recurring("bad", BackgroundCommand::SweepOrphanBlobs, "every tuesday")
                .await
        );
        assert!(matches!(err, AppError::Validation(_)));
    }
}
