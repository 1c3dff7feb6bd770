// Transit Infrastructure - Local System Adapters
// Implements: BlobStore (filesystem), IntegrationEventPublisher (in-process bus), BatchProcessor (CSV),
// StationSource (HTTP)

pub mod csv_inspector;
pub mod event_bus;
pub mod local_blob_store;
pub mod station_source;

pub use csv_inspector::CsvHistoryInspector;
pub use event_bus::{BroadcastEventBus, DEFAULT_BUS_CAPACITY};
pub use local_blob_store::{content_type_for, LocalBlobStore};
pub use station_source::{HttpStationSource, DEFAULT_STATIONS_BASE_URL};
