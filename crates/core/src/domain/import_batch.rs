// Import Batch Aggregate - one uploaded history file and its processing record

use crate::domain::error::{DomainError, Result};
use crate::domain::event::{DomainEvent, EventSource};
use crate::domain::job_status::{JobStatus, JobStatusPolicy};
use crate::domain::outcome_flags::OutcomeFlags;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub const MAX_ERROR_LENGTH: usize = 2000;
pub const MAX_BLOB_FIELD_LENGTH: usize = 64;
pub const MAX_JOB_ID_LENGTH: usize = 100;
pub const SHA256_HEX_LENGTH: usize = 64;

#[derive(Debug, Clone)]
pub struct ImportBatch {
    id: Uuid,
    card_id: Uuid,
    blob_container: String,
    blob_name: String,
    sha256: String,
    status: JobStatus,
    outcome_flags: OutcomeFlags,
    retry_count: i32,
    error: Option<String>,
    uploaded_at: DateTime<Utc>,
    queued_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    failed_at: Option<DateTime<Utc>>,
    canceled_at: Option<DateTime<Utc>>,
    superseded_at: Option<DateTime<Utc>>,
    hangfire_job_id: Option<String>,
    version: i64,
    domain_events: Vec<DomainEvent>,
}

/// Persisted column values used to rebuild a batch from storage
#[derive(Debug, Clone)]
pub struct ImportBatchSnapshot {
    pub id: Uuid,
    pub card_id: Uuid,
    pub blob_container: String,
    pub blob_name: String,
    pub sha256: String,
    pub status: JobStatus,
    pub outcome_flags: OutcomeFlags,
    pub retry_count: i32,
    pub error: Option<String>,
    pub uploaded_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub superseded_at: Option<DateTime<Utc>>,
    pub hangfire_job_id: Option<String>,
    pub version: i64,
}

pub fn is_sha256_hex(value: &str) -> bool {
    value.len() == SHA256_HEX_LENGTH && value.bytes().all(|b| b.is_ascii_hexdigit())
}

fn require_text(value: &str, field: &str, max_len: usize) -> Result<()> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{} cannot be empty.", field)));
    }
    if value.chars().count() > max_len {
        return Err(DomainError::Validation(format!(
            "{} cannot exceed {} characters.",
            field, max_len
        )));
    }
    Ok(())
}

impl ImportBatch {
    /// Create a batch in `Uploaded` state and record `ImportBatchCreated`
    ///
    /// `id` and `now` are injected (v7 id and clock come from providers).
    pub fn create(
        id: Uuid,
        card_id: Uuid,
        blob_container: impl Into<String>,
        blob_name: impl Into<String>,
        sha256: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let blob_container = blob_container.into();
        let blob_name = blob_name.into();
        let sha256 = sha256.into();

        if card_id.is_nil() {
            return Err(DomainError::Validation("Card ID cannot be empty.".to_string()));
        }
        require_text(&blob_container, "Blob container", MAX_BLOB_FIELD_LENGTH)?;
        require_text(&blob_name, "Blob name", MAX_BLOB_FIELD_LENGTH)?;
        require_text(&sha256, "Sha256", SHA256_HEX_LENGTH)?;
        if !is_sha256_hex(&sha256) {
            return Err(DomainError::Validation(
                "Sha256 must be 64 hexadecimal characters.".to_string(),
            ));
        }

        let mut batch = Self {
            id,
            card_id,
            blob_container,
            blob_name,
            sha256,
            status: JobStatus::Uploaded,
            outcome_flags: OutcomeFlags::NONE,
            retry_count: 0,
            error: None,
            uploaded_at: now,
            queued_at: None,
            started_at: None,
            completed_at: None,
            failed_at: None,
            canceled_at: None,
            superseded_at: None,
            hangfire_job_id: None,
            version: 0,
            domain_events: Vec::new(),
        };

        batch.domain_events.push(DomainEvent::ImportBatchCreated {
            batch_id: batch.id,
            card_id: batch.card_id,
            sha256: batch.sha256.clone(),
            occurred_at: now,
        });

        Ok(batch)
    }

    /// Rebuild from storage; no events are recorded
    pub fn rehydrate(snapshot: ImportBatchSnapshot) -> Self {
        Self {
            id: snapshot.id,
            card_id: snapshot.card_id,
            blob_container: snapshot.blob_container,
            blob_name: snapshot.blob_name,
            sha256: snapshot.sha256,
            status: snapshot.status,
            outcome_flags: snapshot.outcome_flags,
            retry_count: snapshot.retry_count,
            error: snapshot.error,
            uploaded_at: snapshot.uploaded_at,
            queued_at: snapshot.queued_at,
            started_at: snapshot.started_at,
            completed_at: snapshot.completed_at,
            failed_at: snapshot.failed_at,
            canceled_at: snapshot.canceled_at,
            superseded_at: snapshot.superseded_at,
            hangfire_job_id: snapshot.hangfire_job_id,
            version: snapshot.version,
            domain_events: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> ImportBatchSnapshot {
        ImportBatchSnapshot {
            id: self.id,
            card_id: self.card_id,
            blob_container: self.blob_container.clone(),
            blob_name: self.blob_name.clone(),
            sha256: self.sha256.clone(),
            status: self.status,
            outcome_flags: self.outcome_flags,
            retry_count: self.retry_count,
            error: self.error.clone(),
            uploaded_at: self.uploaded_at,
            queued_at: self.queued_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            failed_at: self.failed_at,
            canceled_at: self.canceled_at,
            superseded_at: self.superseded_at,
            hangfire_job_id: self.hangfire_job_id.clone(),
            version: self.version,
        }
    }

    pub fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> Result<()> {
        if !JobStatusPolicy::can_transition(self.status, next) {
            return Err(DomainError::InvalidStateTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }

        self.status = next;
        self.stamp(next, now);
        Ok(())
    }

    // First write wins. Uploaded is stamped at creation, Duplicate has no column.
    fn stamp(&mut self, status: JobStatus, now: DateTime<Utc>) {
        let slot = match status {
            JobStatus::Queued => &mut self.queued_at,
            JobStatus::Processing => &mut self.started_at,
            JobStatus::Completed => &mut self.completed_at,
            JobStatus::Failed => &mut self.failed_at,
            JobStatus::Canceled => &mut self.canceled_at,
            JobStatus::Superseded => &mut self.superseded_at,
            JobStatus::Uploaded | JobStatus::Duplicate => return,
        };
        slot.get_or_insert(now);
    }

    pub fn set_hangfire_job_id(&mut self, job_id: &str) -> Result<()> {
        if job_id.trim().is_empty() {
            return Err(DomainError::Validation("Job id cannot be empty.".to_string()));
        }
        if job_id.chars().count() > MAX_JOB_ID_LENGTH {
            return Err(DomainError::Validation(format!(
                "Job id cannot exceed {} characters.",
                MAX_JOB_ID_LENGTH
            )));
        }

        match &self.hangfire_job_id {
            Some(existing) if existing != job_id => Err(DomainError::JobIdConflict {
                existing: existing.clone(),
                requested: job_id.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                self.hangfire_job_id = Some(job_id.to_string());
                Ok(())
            }
        }
    }

    /// Store an error message, truncated to [`MAX_ERROR_LENGTH`] characters
    pub fn set_error(&mut self, error: Option<&str>) {
        self.error = error.map(|e| e.chars().take(MAX_ERROR_LENGTH).collect());
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    pub fn increment_retry(&mut self) {
        self.retry_count += 1;
    }

    pub fn add_outcome_flags(&mut self, flags: OutcomeFlags) {
        self.outcome_flags |= flags;
    }

    pub fn is_terminal(&self) -> bool {
        JobStatusPolicy::is_terminal(self.status)
    }

    pub fn allowed_next(&self) -> &'static [JobStatus] {
        JobStatusPolicy::allowed_next(self.status)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn card_id(&self) -> Uuid {
        self.card_id
    }

    pub fn blob_container(&self) -> &str {
        &self.blob_container
    }

    pub fn blob_name(&self) -> &str {
        &self.blob_name
    }

    pub fn sha256(&self) -> &str {
        &self.sha256
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    pub fn outcome_flags(&self) -> OutcomeFlags {
        self.outcome_flags
    }

    pub fn retry_count(&self) -> i32 {
        self.retry_count
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn uploaded_at(&self) -> DateTime<Utc> {
        self.uploaded_at
    }

    pub fn queued_at(&self) -> Option<DateTime<Utc>> {
        self.queued_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn canceled_at(&self) -> Option<DateTime<Utc>> {
        self.canceled_at
    }

    pub fn superseded_at(&self) -> Option<DateTime<Utc>> {
        self.superseded_at
    }

    pub fn hangfire_job_id(&self) -> Option<&str> {
        self.hangfire_job_id.as_deref()
    }

    /// Concurrency token; only the storage layer advances it
    pub fn version(&self) -> i64 {
        self.version
    }
}

impl EventSource for ImportBatch {
    fn pending_events(&self) -> &[DomainEvent] {
        &self.domain_events
    }

    fn take_domain_events(&mut self) -> Vec<DomainEvent> {
        std::mem::take(&mut self.domain_events)
    }

    fn restore_domain_events(&mut self, mut events: Vec<DomainEvent>) {
        events.append(&mut self.domain_events);
        self.domain_events = events;
    }
}
