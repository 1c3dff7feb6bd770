// Job Scheduler Port
// Feature code hands commands to the background runtime through this

use crate::domain::{BackgroundCommand, JobId};
use crate::error::Result;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait JobScheduler: Send + Sync {
    /// Run as soon as a worker is free
    async fn enqueue(&self, command: BackgroundCommand) -> Result<JobId>;

    /// Run once after `delay`
    async fn schedule(&self, command: BackgroundCommand, delay: Duration) -> Result<JobId>;

    /// Create or replace the schedule `recurring_id`
    ///
    /// Accepts 5-field (minute first) or 6/7-field (seconds first) cron expressions.
    async fn schedule_recurring(
        &self,
        recurring_id: &str,
        command: BackgroundCommand,
        cron: &str,
    ) -> Result<()>;

    /// `false` when no schedule had that id
    async fn remove_recurring(&self, recurring_id: &str) -> Result<bool>;
}
