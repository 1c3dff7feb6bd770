// Job Queue Port (Interface)

use crate::domain::{BackgroundJob, BackgroundJobState, JobId, RecurringJob};
use crate::error::Result;
use async_trait::async_trait;

/// Persistence for background jobs and recurring schedules
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Insert a new job
    async fn insert(&self, job: &BackgroundJob) -> Result<()>;

    /// Find job by ID
    async fn find_by_id(&self, id: &JobId) -> Result<Option<BackgroundJob>>;

    /// Update job
    async fn update(&self, job: &BackgroundJob) -> Result<()>;

    /// Atomically claim the oldest due job of `queue` (state becomes PROCESSING)
    async fn pop_due(&self, queue: &str, now_millis: i64) -> Result<Option<BackgroundJob>>;

    /// Count jobs by state
    async fn count_by_state(&self, queue: &str, state: BackgroundJobState) -> Result<i64>;

    /// Find all jobs by state (for recovery)
    async fn find_by_state(&self, state: BackgroundJobState) -> Result<Vec<BackgroundJob>>;

    /// Insert a recurring schedule or update an existing one
    ///
    /// An existing schedule keeps `last_run_at`, and keeps `next_run_at` unless
    /// the cron expression changed.
    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()>;

    /// `false` when no schedule had that id
    async fn remove_recurring(&self, id: &str) -> Result<bool>;

    /// Schedules whose `next_run_at` has passed
    async fn due_recurring(&self, now_millis: i64) -> Result<Vec<RecurringJob>>;

    /// Move a schedule from `expected_next` to `next_run_at`
    ///
    /// Returns `false` when another worker already advanced it.
    async fn advance_recurring(
        &self,
        id: &str,
        expected_next: i64,
        fired_at: i64,
        next_run_at: i64,
    ) -> Result<bool>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryJobQueue {
        jobs: Mutex<BTreeMap<JobId, BackgroundJob>>,
        recurring: Mutex<BTreeMap<String, RecurringJob>>,
    }

    impl InMemoryJobQueue {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn all_jobs(&self) -> Vec<BackgroundJob> {
            self.jobs.lock().unwrap().values().cloned().collect()
        }

        pub fn recurring(&self, id: &str) -> Option<RecurringJob> {
            self.recurring.lock().unwrap().get(id).cloned()
        }
    }

    #[async_trait]
    impl JobQueue for InMemoryJobQueue {
        async fn insert(&self, job: &BackgroundJob) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                return Err(AppError::Conflict(format!("Job {} already exists", job.id)));
            }
            jobs.insert(job.id.clone(), job.clone());
            Ok(())
        }

        async fn find_by_id(&self, id: &JobId) -> Result<Option<BackgroundJob>> {
            Ok(self.jobs.lock().unwrap().get(id).cloned())
        }

        async fn update(&self, job: &BackgroundJob) -> Result<()> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.get_mut(&job.id) {
                Some(existing) => {
                    *existing = job.clone();
                    Ok(())
                }
                None => Err(AppError::NotFound(format!("Job {} not found", job.id))),
            }
        }

        async fn pop_due(&self, queue: &str, now_millis: i64) -> Result<Option<BackgroundJob>> {
            let mut jobs = self.jobs.lock().unwrap();
            let next = jobs
                .values_mut()
                .filter(|j| j.queue == queue && j.is_due(now_millis))
                .min_by(|a, b| (a.run_at, a.created_at, &a.id).cmp(&(b.run_at, b.created_at, &b.id)));

            match next {
                Some(job) => {
                    job.start(now_millis)?;
                    Ok(Some(job.clone()))
                }
                None => Ok(None),
            }
        }

        async fn count_by_state(&self, queue: &str, state: BackgroundJobState) -> Result<i64> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.queue == queue && j.state == state)
                .count() as i64)
        }

        async fn find_by_state(&self, state: BackgroundJobState) -> Result<Vec<BackgroundJob>> {
            Ok(self
                .jobs
                .lock()
                .unwrap()
                .values()
                .filter(|j| j.state == state)
                .cloned()
                .collect())
        }

        async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
            let mut recurring = self.recurring.lock().unwrap();
            match recurring.get_mut(&job.id) {
                Some(existing) => {
                    if existing.cron != job.cron {
                        existing.next_run_at = job.next_run_at;
                    }
                    existing.queue = job.queue.clone();
                    existing.command = job.command.clone();
                    existing.cron = job.cron.clone();
                }
                None => {
                    recurring.insert(job.id.clone(), job.clone());
                }
            }
            Ok(())
        }

        async fn remove_recurring(&self, id: &str) -> Result<bool> {
            Ok(self.recurring.lock().unwrap().remove(id).is_some())
        }

        async fn due_recurring(&self, now_millis: i64) -> Result<Vec<RecurringJob>> {
            Ok(self
                .recurring
                .lock()
                .unwrap()
                .values()
                .filter(|r| r.next_run_at <= now_millis)
                .cloned()
                .collect())
        }

        async fn advance_recurring(
            &self,
            id: &str,
            expected_next: i64,
            fired_at: i64,
            next_run_at: i64,
        ) -> Result<bool> {
            let mut recurring = self.recurring.lock().unwrap();
            match recurring.get_mut(id) {
                Some(r) if r.next_run_at == expected_next => {
                    r.last_run_at = Some(fired_at);
                    r.next_run_at = next_run_at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }
}
