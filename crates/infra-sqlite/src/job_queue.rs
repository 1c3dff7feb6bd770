// SQLite JobQueue Implementation

use crate::error::{corrupt_row, map_sqlx_error};
use async_trait::async_trait;
use sqlx::SqlitePool;
use transit_core::domain::{BackgroundCommand, BackgroundJob, BackgroundJobState, JobId, RecurringJob};
use transit_core::error::{AppError, Result};
use transit_core::port::JobQueue;

pub struct SqliteJobQueue {
    pool: SqlitePool,
}

impl SqliteJobQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_command(command: &BackgroundCommand) -> Result<String> {
    Ok(serde_json::to_string(command)?)
}

#[async_trait]
impl JobQueue for SqliteJobQueue {
    async fn insert(&self, job: &BackgroundJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO background_jobs (
                id, queue, command, state,
                attempts, max_attempts,
                run_at, created_at, started_at, finished_at,
                last_error, recurring_id
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(encode_command(&job.command)?)
        .bind(job.state.to_string())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(job.created_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.last_error)
        .bind(&job.recurring_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn find_by_id(&self, id: &JobId) -> Result<Option<BackgroundJob>> {
        let row = sqlx::query_as::<_, BackgroundJobRow>("SELECT * FROM background_jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        row.map(BackgroundJobRow::into_job).transpose()
    }

    async fn update(&self, job: &BackgroundJob) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE background_jobs
            SET state = ?, attempts = ?, max_attempts = ?,
                run_at = ?, started_at = ?, finished_at = ?,
                last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(job.state.to_string())
        .bind(job.attempts)
        .bind(job.max_attempts)
        .bind(job.run_at)
        .bind(job.started_at)
        .bind(job.finished_at)
        .bind(&job.last_error)
        .bind(&job.id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Job {} not found", job.id)));
        }
        Ok(())
    }

    async fn pop_due(&self, queue: &str, now_millis: i64) -> Result<Option<BackgroundJob>> {
        // Select and claim in one statement so two workers never get the same job
        let row = sqlx::query_as::<_, BackgroundJobRow>(
            r#"
            UPDATE background_jobs
            SET state = ?, started_at = ?
            WHERE id = (
                SELECT id FROM background_jobs
                WHERE queue = ? AND state = ? AND run_at <= ?
                ORDER BY run_at ASC, created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(BackgroundJobState::Processing.to_string())
        .bind(now_millis)
        .bind(queue)
        .bind(BackgroundJobState::Enqueued.to_string())
        .bind(now_millis)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        row.map(BackgroundJobRow::into_job).transpose()
    }

    async fn count_by_state(&self, queue: &str, state: BackgroundJobState) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM background_jobs WHERE queue = ? AND state = ?",
        )
        .bind(queue)
        .bind(state.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(count)
    }

    async fn find_by_state(&self, state: BackgroundJobState) -> Result<Vec<BackgroundJob>> {
        let rows: Vec<BackgroundJobRow> = sqlx::query_as(
            r#"
            SELECT * FROM background_jobs
            WHERE state = ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(state.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(BackgroundJobRow::into_job).collect()
    }

    async fn upsert_recurring(&self, job: &RecurringJob) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO recurring_jobs (id, queue, command, cron, next_run_at, last_run_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                queue = excluded.queue,
                command = excluded.command,
                next_run_at = CASE
                    WHEN recurring_jobs.cron = excluded.cron THEN recurring_jobs.next_run_at
                    ELSE excluded.next_run_at
                END,
                cron = excluded.cron
            "#,
        )
        .bind(&job.id)
        .bind(&job.queue)
        .bind(encode_command(&job.command)?)
        .bind(&job.cron)
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    async fn remove_recurring(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM recurring_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn due_recurring(&self, now_millis: i64) -> Result<Vec<RecurringJob>> {
        let rows: Vec<RecurringJobRow> = sqlx::query_as(
            "SELECT * FROM recurring_jobs WHERE next_run_at <= ? ORDER BY next_run_at ASC, id ASC",
        )
        .bind(now_millis)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.into_iter().map(RecurringJobRow::into_recurring).collect()
    }

    async fn advance_recurring(
        &self,
        id: &str,
        expected_next: i64,
        fired_at: i64,
        next_run_at: i64,
    ) -> Result<bool> {
        // Conditional update: only one worker fires a given occurrence
        let result = sqlx::query(
            r#"
            UPDATE recurring_jobs
            SET last_run_at = ?, next_run_at = ?
            WHERE id = ? AND next_run_at = ?
            "#,
        )
        .bind(fired_at)
        .bind(next_run_at)
        .bind(id)
        .bind(expected_next)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() > 0)
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BackgroundJobRow {
    id: String,
    queue: String,
    command: String,
    state: String,
    attempts: i32,
    max_attempts: i32,
    run_at: i64,
    created_at: i64,
    started_at: Option<i64>,
    finished_at: Option<i64>,
    last_error: Option<String>,
    recurring_id: Option<String>,
}

impl BackgroundJobRow {
    fn into_job(self) -> Result<BackgroundJob> {
        let state = BackgroundJobState::parse(&self.state)
            .ok_or_else(|| corrupt_row("background_jobs", &self.id, format!("state {}", self.state)))?;
        let command: BackgroundCommand = serde_json::from_str(&self.command)
            .map_err(|e| corrupt_row("background_jobs", &self.id, e))?;

        Ok(BackgroundJob {
            id: self.id,
            queue: self.queue,
            command,
            state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            run_at: self.run_at,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            last_error: self.last_error,
            recurring_id: self.recurring_id,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecurringJobRow {
    id: String,
    queue: String,
    command: String,
    cron: String,
    next_run_at: i64,
    last_run_at: Option<i64>,
}

impl RecurringJobRow {
    fn into_recurring(self) -> Result<RecurringJob> {
        let command: BackgroundCommand = serde_json::from_str(&self.command)
            .map_err(|e| corrupt_row("recurring_jobs", &self.id, e))?;

        Ok(RecurringJob {
            id: self.id,
            queue: self.queue,
            command,
            cron: self.cron,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use uuid::Uuid;

    async fn setup_queue() -> SqliteJobQueue {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        SqliteJobQueue::new(pool)
    }

    #[tokio::test]
    async fn test_insert_and_find() {
        let queue = setup_queue().await;
        let batch_id = Uuid::now_v7();
        let job = BackgroundJob::new_test("default", BackgroundCommand::ProcessImportBatch { batch_id });

        queue.insert(&job).await.unwrap();

        let found = queue.find_by_id(&job.id).await.unwrap().unwrap();
        assert_eq!(found, job);
        assert!(matches!(queue.insert(&job).await, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_pop_due_claims_oldest_due_job_once() {
        let queue = setup_queue().await;
        let early = BackgroundJob::new("a", 1_000, "default", BackgroundCommand::DeleteExpiredCards);
        let later = BackgroundJob::new("b", 500, "default", BackgroundCommand::SweepOrphanBlobs)
            .with_run_at(2_000);
        let future = BackgroundJob::new("c", 100, "default", BackgroundCommand::SweepOrphanBlobs)
            .with_run_at(10_000);
        let other_queue = BackgroundJob::new("d", 100, "reports", BackgroundCommand::SweepOrphanBlobs);
        for job in [&early, &later, &future, &other_queue] {
            queue.insert(job).await.unwrap();
        }

        let first = queue.pop_due("default", 5_000).await.unwrap().unwrap();
        assert_eq!(first.id, "a");
        assert_eq!(first.state, BackgroundJobState::Processing);
        assert_eq!(first.started_at, Some(5_000));

        let second = queue.pop_due("default", 5_000).await.unwrap().unwrap();
        assert_eq!(second.id, "b");
        assert!(queue.pop_due("default", 5_000).await.unwrap().is_none());

        assert_eq!(
            queue
                .count_by_state("default", BackgroundJobState::Processing)
                .await
                .unwrap(),
            2
        );
        assert_eq!(
            queue
                .find_by_state(BackgroundJobState::Processing)
                .await
                .unwrap()
                .len(),
            2
        );
    }

    #[tokio::test]
    async fn test_update_reschedules_job() {
        let queue = setup_queue().await;
        let job = BackgroundJob::new("retry-me", 0, "default", BackgroundCommand::DeleteExpiredCards);
        queue.insert(&job).await.unwrap();

        let mut claimed = queue.pop_due("default", 100).await.unwrap().unwrap();
        claimed.reschedule(60_100, "database is locked");
        queue.update(&claimed).await.unwrap();

        let stored = queue.find_by_id(&claimed.id).await.unwrap().unwrap();
        assert_eq!(stored.state, BackgroundJobState::Enqueued);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("database is locked"));
        assert!(queue.pop_due("default", 60_000).await.unwrap().is_none());
        assert!(queue.pop_due("default", 60_100).await.unwrap().is_some());

        let missing = BackgroundJob::new("ghost", 0, "default", BackgroundCommand::SweepOrphanBlobs);
        assert!(matches!(queue.update(&missing).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_recurring_schedule_is_advanced_once() {
        let queue = setup_queue().await;
        let recurring = RecurringJob {
            id: "delete-expired-cards".to_string(),
            queue: "default".to_string(),
            command: BackgroundCommand::DeleteExpiredCards,
            cron: "0 0 * * *".to_string(),
            next_run_at: 1_000,
            last_run_at: None,
        };
        queue.upsert_recurring(&recurring).await.unwrap();
        queue.upsert_recurring(&recurring).await.unwrap();

        assert!(queue.due_recurring(999).await.unwrap().is_empty());
        let due = queue.due_recurring(1_000).await.unwrap();
        assert_eq!(due, vec![recurring.clone()]);

        assert!(queue
            .advance_recurring(&recurring.id, 1_000, 1_005, 87_400_000)
            .await
            .unwrap());
        assert!(!queue
            .advance_recurring(&recurring.id, 1_000, 1_006, 87_400_000)
            .await
            .unwrap());
        assert!(queue.due_recurring(2_000).await.unwrap().is_empty());

        assert!(queue.remove_recurring(&recurring.id).await.unwrap());
        assert!(!queue.remove_recurring(&recurring.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_reregistering_keeps_schedule_progress() {
        let queue = setup_queue().await;
        let mut recurring = RecurringJob {
            id: "sweep-orphan-blobs".to_string(),
            queue: "default".to_string(),
            command: BackgroundCommand::SweepOrphanBlobs,
            cron: "0 * * * *".to_string(),
            next_run_at: 3_600_000,
            last_run_at: None,
        };
        queue.upsert_recurring(&recurring).await.unwrap();
        assert!(queue
            .advance_recurring(&recurring.id, 3_600_000, 3_600_010, 7_200_000)
            .await
            .unwrap());

        // A restart registers the same cron with a freshly computed next run
        recurring.next_run_at = 10_800_000;
        queue.upsert_recurring(&recurring).await.unwrap();
        let stored = queue.due_recurring(7_200_000).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].next_run_at, 7_200_000);
        assert_eq!(stored[0].last_run_at, Some(3_600_010));

        // A changed cron takes the new next run
        recurring.cron = "*/5 * * * *".to_string();
        recurring.next_run_at = 7_500_000;
        queue.upsert_recurring(&recurring).await.unwrap();
        assert!(queue.due_recurring(7_200_000).await.unwrap().is_empty());
        let stored = queue.due_recurring(7_500_000).await.unwrap();
        assert_eq!(stored[0].cron, "*/5 * * * *");
        assert_eq!(stored[0].last_run_at, Some(3_600_010));
    }
}
