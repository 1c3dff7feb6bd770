// Repository Layer - query/command gateways with per-entity protection rules

pub mod command;
pub mod protection;
pub mod protections;
pub mod query;

// Re-exports
pub use command::{CommandRepo, Persist, SecureCommandRepo};
pub use protection::{Protection, ProtectionRegistry, RepositoryOperation};
pub use protections::{default_registry, CardProtection, ImportBatchProtection};
pub use query::{Query, QueryRepo, SecureQueryRepo};
