// Retry logic for background jobs
use crate::domain::BackgroundJob;
use crate::error::AppError;
use std::time::Duration;
use tracing::{info, warn};

/// Delay before each automatic retry: 1 minute, 5 minutes, 15 minutes
pub const DEFAULT_RETRY_DELAYS: [Duration; 3] = [
    Duration::from_secs(60),
    Duration::from_secs(300),
    Duration::from_secs(900),
];

/// Retry decision result
#[derive(Debug, PartialEq, Eq)]
pub enum RetryDecision {
    /// Run again after this many milliseconds
    Retry(i64),
    /// Do not retry, job has failed permanently
    Failed,
}

/// Fixed-schedule retry policy
///
/// The n-th retry waits `delays[n]`; attempts past the end of the schedule reuse
/// the last delay. Errors that are not retryable fail the job at once.
pub struct RetryPolicy {
    delays: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_DELAYS.to_vec())
    }
}

impl RetryPolicy {
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    pub fn should_retry(&self, job: &BackgroundJob, error: &AppError) -> RetryDecision {
        if !error.is_retryable() {
            warn!(
                job_id = %job.id,
                error = %error,
                "Non-retryable failure, not retrying"
            );
            return RetryDecision::Failed;
        }

        if job.attempts >= job.max_attempts {
            warn!(
                job_id = %job.id,
                attempts = %job.attempts,
                max_attempts = %job.max_attempts,
                "Max retry attempts reached"
            );
            return RetryDecision::Failed;
        }

        let Some(delay) = self
            .delays
            .get(job.attempts.max(0) as usize)
            .or_else(|| self.delays.last())
        else {
            return RetryDecision::Failed;
        };
        let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);

        info!(
            job_id = %job.id,
            attempt = %job.attempts,
            max_attempts = %job.max_attempts,
            delay_ms = %delay_ms,
            "Scheduling retry"
        );

        RetryDecision::Retry(delay_ms)
    }
}
