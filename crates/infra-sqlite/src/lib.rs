// Transit Infrastructure - SQLite Adapter
// Implements: EntityStore (cards, import batches), JobQueue (background jobs, recurring schedules),
// StationRepository (stations, transport modes)

mod connection;
mod entity_store;
mod error;
mod job_queue;
mod migration;
mod station_repository;

pub use connection::create_pool;
pub use entity_store::SqliteEntityStore;
pub use job_queue::SqliteJobQueue;
pub use migration::run_migrations;
pub use station_repository::SqliteStationRepository;

// Note: sqlx::Error conversion is handled by map_sqlx_error
// due to Rust's orphan rules (cannot implement From<sqlx::Error> for AppError here)
