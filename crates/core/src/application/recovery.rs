// Crash recovery for background jobs
use crate::domain::BackgroundJobState;
use crate::port::{JobQueue, TimeProvider};
use std::sync::Arc;
use tracing::{info, warn};

use crate::application::worker::constants::DEFAULT_RECOVERY_WINDOW_MS;

/// Crash recovery service
///
/// On daemon startup, puts jobs that were PROCESSING when the daemon died back
/// into the queue. Every command is safe to run again, so none are failed here.
pub struct RecoveryService {
    jobs: Arc<dyn JobQueue>,
    time_provider: Arc<dyn TimeProvider>,
    recovery_window_ms: i64,
}

impl RecoveryService {
    /// `recovery_window_ms` defaults to 5 minutes
    pub fn new(
        jobs: Arc<dyn JobQueue>,
        time_provider: Arc<dyn TimeProvider>,
        recovery_window_ms: Option<i64>,
    ) -> Self {
        Self {
            jobs,
            time_provider,
            recovery_window_ms: recovery_window_ms.unwrap_or(DEFAULT_RECOVERY_WINDOW_MS),
        }
    }

    /// Requeue PROCESSING jobs started before `now - recovery_window`
    ///
    /// # Returns
    /// Number of jobs recovered
    pub async fn recover_orphaned_jobs(&self) -> crate::error::Result<usize> {
        let now = self.time_provider.now_millis();
        let cutoff = now - self.recovery_window_ms;

        info!(
            cutoff_time = %cutoff,
            recovery_window_ms = %self.recovery_window_ms,
            "Starting orphaned job recovery"
        );

        let processing = self.jobs.find_by_state(BackgroundJobState::Processing).await?;
        let mut recovered_count = 0;

        for mut job in processing {
            match job.started_at {
                Some(started_at) if started_at >= cutoff => continue,
                Some(started_at) => {
                    info!(
                        job_id = %job.id,
                        command = job.command.name(),
                        started_at = %started_at,
                        "Requeueing orphaned job"
                    );
                }
                None => {
                    warn!(job_id = %job.id, "PROCESSING job without started_at, requeueing");
                }
            }

            job.state = BackgroundJobState::Enqueued;
            job.started_at = None;
            job.run_at = now;
            self.jobs.update(&job).await?;
            recovered_count += 1;
        }

        info!(recovered_count = %recovered_count, "Orphaned job recovery complete");
        Ok(recovered_count)
    }
}
