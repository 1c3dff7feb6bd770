// Background Job Domain Model

use crate::domain::error::{DomainError, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type JobId = String;

pub type QueueId = String;

/// Automatic retries after the first failed execution
pub const DEFAULT_MAX_RETRIES: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackgroundJobState {
    Enqueued,
    Processing,
    Succeeded,
    Failed,
}

impl BackgroundJobState {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ENQUEUED" => Some(Self::Enqueued),
            "PROCESSING" => Some(Self::Processing),
            "SUCCEEDED" => Some(Self::Succeeded),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BackgroundJobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackgroundJobState::Enqueued => write!(f, "ENQUEUED"),
            BackgroundJobState::Processing => write!(f, "PROCESSING"),
            BackgroundJobState::Succeeded => write!(f, "SUCCEEDED"),
            BackgroundJobState::Failed => write!(f, "FAILED"),
        }
    }
}

/// Work items the background worker knows how to execute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackgroundCommand {
    DeleteExpiredCards,
    QueueImportBatch { batch_id: Uuid },
    ProcessImportBatch { batch_id: Uuid },
    RequeueStalledBatches,
    SweepOrphanBlobs,
    SyncStations,
}

impl BackgroundCommand {
    pub fn name(&self) -> &'static str {
        match self {
            BackgroundCommand::DeleteExpiredCards => "DeleteExpiredCards",
            BackgroundCommand::QueueImportBatch { .. } => "QueueImportBatch",
            BackgroundCommand::ProcessImportBatch { .. } => "ProcessImportBatch",
            BackgroundCommand::RequeueStalledBatches => "RequeueStalledBatches",
            BackgroundCommand::SweepOrphanBlobs => "SweepOrphanBlobs",
            BackgroundCommand::SyncStations => "SyncStations",
        }
    }
}

/// A queued command execution (times are epoch ms)
#[derive(Debug, Clone, PartialEq)]
pub struct BackgroundJob {
    pub id: JobId,
    pub queue: QueueId,
    pub command: BackgroundCommand,
    pub state: BackgroundJobState,

    pub attempts: i32,
    pub max_attempts: i32,

    pub run_at: i64,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub finished_at: Option<i64>,

    pub last_error: Option<String>,
    pub recurring_id: Option<String>,
}

impl BackgroundJob {
    /// Create a job that is due immediately
    ///
    /// `id` and `created_at` are injected by providers, never generated here.
    pub fn new(
        id: impl Into<String>,
        created_at: i64,
        queue: impl Into<String>,
        command: BackgroundCommand,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            command,
            state: BackgroundJobState::Enqueued,
            attempts: 0,
            max_attempts: DEFAULT_MAX_RETRIES,
            run_at: created_at,
            created_at,
            started_at: None,
            finished_at: None,
            last_error: None,
            recurring_id: None,
        }
    }

    /// Deterministic ids (test-1, test-2, ...) and timestamps for tests
    pub fn new_test(queue: impl Into<String>, command: BackgroundCommand) -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

        let counter = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        Self::new(
            format!("test-{}", counter),
            (counter * 1000) as i64,
            queue,
            command,
        )
    }

    pub fn with_run_at(mut self, run_at: i64) -> Self {
        self.run_at = run_at;
        self
    }

    pub fn is_due(&self, now_millis: i64) -> bool {
        self.state == BackgroundJobState::Enqueued && self.run_at <= now_millis
    }

    pub fn start(&mut self, now_millis: i64) -> Result<()> {
        if self.state != BackgroundJobState::Enqueued {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: BackgroundJobState::Processing.to_string(),
            });
        }
        self.state = BackgroundJobState::Processing;
        self.started_at = Some(now_millis);
        Ok(())
    }

    pub fn succeed(&mut self, now_millis: i64) -> Result<()> {
        if self.state != BackgroundJobState::Processing {
            return Err(DomainError::InvalidStateTransition {
                from: self.state.to_string(),
                to: BackgroundJobState::Succeeded.to_string(),
            });
        }
        self.state = BackgroundJobState::Succeeded;
        self.finished_at = Some(now_millis);
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, now_millis: i64, error: impl Into<String>) {
        self.state = BackgroundJobState::Failed;
        self.finished_at = Some(now_millis);
        self.last_error = Some(error.into());
    }

    /// Put the job back in the queue for another attempt at `run_at`
    pub fn reschedule(&mut self, run_at: i64, error: impl Into<String>) {
        self.attempts += 1;
        self.state = BackgroundJobState::Enqueued;
        self.started_at = None;
        self.run_at = run_at;
        self.last_error = Some(error.into());
    }
}

/// Cron-driven template that enqueues a fresh job each time it fires
#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub id: String,
    pub queue: QueueId,
    pub command: BackgroundCommand,
    pub cron: String,
    pub next_run_at: i64,
    pub last_run_at: Option<i64>,
}
