// Worker - Job execution loop

pub mod constants;

use constants::*;

use crate::application::commands::CommandHandler;
use crate::application::retry::{RetryDecision, RetryPolicy};
use crate::application::scheduler::{next_occurrence, parse_cron};
use crate::domain::BackgroundJob;
use crate::error::Result;
use crate::port::{IdProvider, JobQueue, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Worker tuning handed in by the composition root
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub queue: String,
    pub poll_interval: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue: DEFAULT_QUEUE.to_string(),
            poll_interval: IDLE_SLEEP_DURATION,
        }
    }
}

/// Worker processes jobs from one queue and fires due recurring schedules
pub struct Worker {
    settings: WorkerSettings,
    jobs: Arc<dyn JobQueue>,
    handler: Arc<dyn CommandHandler>,
    retry_policy: Arc<RetryPolicy>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        jobs: Arc<dyn JobQueue>,
        handler: Arc<dyn CommandHandler>,
        retry_policy: Arc<RetryPolicy>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            settings,
            jobs,
            handler,
            retry_policy,
            id_provider,
            time_provider,
        }
    }

    /// Run worker loop until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        let queue = self.settings.queue.as_str();
        info!("Worker started for queue: {}", queue);
        loop {
            if shutdown.is_cancelled() {
                info!("Worker shutting down for queue: {}", queue);
                break;
            }

            let tick = async {
                self.fire_due_recurring().await?;
                self.process_next_job().await
            };
            match tick.await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = sleep(self.settings.poll_interval) => {},
                        _ = shutdown.cancelled() => {
                            info!("Worker interrupted during idle");
                            break;
                        }
                    }
                }
                Err(e) => {
                    error!("Worker error: {}", e);
                    tokio::select! {
                        _ = sleep(ERROR_RECOVERY_SLEEP_DURATION) => {},
                        _ = shutdown.cancelled() => {
                            info!("Worker interrupted during error recovery");
                            break;
                        }
                    }
                }
            }
        }
        info!("Worker stopped for queue: {}", queue);
        Ok(())
    }

    /// Enqueue one job per due recurring schedule (returns how many fired)
    ///
    /// A schedule that another worker already advanced is skipped.
    pub async fn fire_due_recurring(&self) -> Result<usize> {
        let now = self.time_provider.now();
        let now_ms = now.timestamp_millis();
        let mut fired = 0;

        for recurring in self.jobs.due_recurring(now_ms).await? {
            let next_run_at = match parse_cron(&recurring.cron)
                .map(|schedule| next_occurrence(&schedule, now))
            {
                Ok(Some(next)) => next,
                Ok(None) | Err(_) => {
                    warn!(
                        recurring_id = %recurring.id,
                        cron = %recurring.cron,
                        "Recurring job has no next occurrence, skipping"
                    );
                    continue;
                }
            };

            let claimed = self
                .jobs
                .advance_recurring(&recurring.id, recurring.next_run_at, now_ms, next_run_at)
                .await?;
            if !claimed {
                continue;
            }

            let mut job = BackgroundJob::new(
                self.id_provider.generate_id().to_string(),
                now_ms,
                recurring.queue.clone(),
                recurring.command.clone(),
            );
            job.recurring_id = Some(recurring.id.clone());
            self.jobs.insert(&job).await?;

            info!(
                recurring_id = %recurring.id,
                job_id = %job.id,
                command = job.command.name(),
                next_run_at = next_run_at,
                "Recurring job fired"
            );
            fired += 1;
        }
        Ok(fired)
    }

    /// Process next job from queue (returns true if job was processed)
    pub async fn process_next_job(&self) -> Result<bool> {
        let now = self.time_provider.now_millis();

        // Pop next job (already atomically set to PROCESSING in storage)
        let mut job = match self.jobs.pop_due(&self.settings.queue, now).await? {
            Some(j) => j,
            None => return Ok(false),
        };

        info!(job_id = %job.id, command = job.command.name(), attempt = job.attempts, "Processing job");

        // A panicking command must not take the worker down with it
        let handler = Arc::clone(&self.handler);
        let command = job.command.clone();
        let handle = tokio::task::spawn(async move { handler.execute(&command).await });
        let execution_result = handle.await;

        let now = self.time_provider.now_millis();
        match execution_result {
            Ok(Ok(())) => {
                job.succeed(now)?;
                info!("Job completed: {}", job.id);
                self.jobs.update(&job).await?;
            }
            Ok(Err(e)) => match self.retry_policy.should_retry(&job, &e) {
                RetryDecision::Retry(delay_ms) => {
                    info!(
                        job_id = %job.id,
                        attempt = %job.attempts,
                        delay_ms = %delay_ms,
                        error = %e,
                        "Retrying job after failure"
                    );
                    job.reschedule(now.saturating_add(delay_ms), e.to_string());
                    self.jobs.update(&job).await?;
                }
                RetryDecision::Failed => {
                    error!("Job failed {}: {}", job.id, e);
                    job.fail(now, e.to_string());
                    self.jobs.update(&job).await?;
                    self.after_exhausted(&job).await;
                }
            },
            Err(join_err) => {
                let reason = if join_err.is_panic() {
                    error!("Job panicked {}: {:?}", job.id, join_err);
                    "command panicked"
                } else {
                    error!("Job cancelled {}: {:?}", job.id, join_err);
                    "command task cancelled"
                };
                job.fail(now, reason);
                self.jobs.update(&job).await?;
                self.after_exhausted(&job).await;
            }
        }
        Ok(true)
    }

    async fn after_exhausted(&self, job: &BackgroundJob) {
        let reason = job.last_error.as_deref().unwrap_or("job failed");
        if let Err(e) = self.handler.on_exhausted(&job.command, reason).await {
            error!(job_id = %job.id, command = job.command.name(), error = %e, "Cleanup after failed job did not complete");
        }
    }
}
