// Application Layer - Use Cases and Business Logic

pub mod batch_lifecycle;
pub mod cards;
pub mod commands;
pub mod events;
pub mod import_history;
pub mod recovery;
pub mod retry;
pub mod scheduler;
pub mod stations;
pub mod worker;

// Re-exports
pub use batch_lifecycle::{BatchLifecycle, ImportBatchCreatedConsumer, LifecycleSettings};
pub use cards::{CardRequest, CardService};
pub use commands::{CommandDispatcher, CommandHandler};
pub use events::{default_dispatcher, DomainEventDispatcher, DomainEventHandler, ImportBatchCreatedHandler};
pub use import_history::{
    ImportContent, ImportHistoryRequest, ImportHistoryResponse, ImportHistoryService,
    ImportSettings, IMPORT_CONTAINER,
};
pub use recovery::RecoveryService;
pub use retry::RetryPolicy;
pub use scheduler::QueueJobScheduler;
pub use stations::{StationSyncReport, StationSyncService};
pub use worker::{Worker, WorkerSettings};
