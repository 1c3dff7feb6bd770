// Port Layer - Interfaces for external dependencies

pub mod batch_processor;
pub mod blob_store;
pub mod entity_store;
pub mod event_publisher;
pub mod id_provider; // For deterministic testing
pub mod identity;
pub mod job_queue;
pub mod job_scheduler;
pub mod station_repository;
pub mod station_source;
pub mod time_provider;

// Re-exports
pub use batch_processor::BatchProcessor;
pub use blob_store::{BlobError, BlobInfo, BlobMetadata, BlobReader, BlobStore};
pub use entity_store::{
    Change, ChangeKind, EntityRecord, EntityStore, EntityTable, FieldValue, Filter, QuerySpec,
    Record, SortOrder,
};
pub use event_publisher::{
    IntegrationEvent, IntegrationEventHandler, IntegrationEventPublisher, IntegrationPayload,
};
pub use id_provider::IdProvider;
pub use identity::{Claim, ClaimsIdentity, IdentityContext};
pub use job_queue::JobQueue;
pub use job_scheduler::JobScheduler;
pub use station_repository::{StationChanges, StationRepository};
pub use station_source::{StationSource, UpstreamGeometry, UpstreamStation};
pub use time_provider::TimeProvider;
