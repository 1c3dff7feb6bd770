// Domain Layer - Pure business logic and entities

pub mod background_job;
pub mod card;
pub mod error;
pub mod event;
pub mod import_batch;
pub mod job_status;
pub mod outcome_flags;
pub mod station;

// Re-exports
pub use background_job::{
    BackgroundCommand, BackgroundJob, BackgroundJobState, JobId, QueueId, RecurringJob,
};
pub use card::{Card, CardType};
pub use error::DomainError;
pub use event::{DomainEvent, DomainEventKind, EventSource};
pub use import_batch::{ImportBatch, ImportBatchSnapshot};
pub use job_status::{JobStatus, JobStatusPolicy};
pub use outcome_flags::OutcomeFlags;
pub use station::{GeoPoint, Station, TransportMode};
