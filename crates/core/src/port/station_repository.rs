// Station Repository Port

use crate::domain::{Station, TransportMode};
use crate::error::Result;
use async_trait::async_trait;

/// Everything one station sync writes
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StationChanges {
    pub new_modes: Vec<TransportMode>,
    pub inserted: Vec<Station>,
    pub updated: Vec<Station>,
}

impl StationChanges {
    pub fn is_empty(&self) -> bool {
        self.new_modes.is_empty() && self.inserted.is_empty() && self.updated.is_empty()
    }
}

#[async_trait]
pub trait StationRepository: Send + Sync {
    /// All stations with their transport mode ids
    async fn list_stations(&self) -> Result<Vec<Station>>;

    async fn list_transport_modes(&self) -> Result<Vec<TransportMode>>;

    /// Apply all changes in one transaction
    ///
    /// # Errors
    /// - `Conflict` when an external id or mode name is already taken
    /// - `NotFound` when an updated station is gone
    async fn apply(&self, changes: &StationChanges) -> Result<()>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use uuid::Uuid;

    #[derive(Default, Clone)]
    struct Tables {
        stations: BTreeMap<Uuid, Station>,
        modes: BTreeMap<Uuid, TransportMode>,
    }

    #[derive(Default)]
    pub struct InMemoryStationRepository {
        tables: Mutex<Tables>,
        applies: AtomicUsize,
    }

    impl InMemoryStationRepository {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of non-empty change sets applied
        pub fn apply_count(&self) -> usize {
            self.applies.load(Ordering::SeqCst)
        }

        pub fn by_external_id(&self, external_id: &str) -> Option<Station> {
            self.tables
                .lock()
                .unwrap()
                .stations
                .values()
                .find(|s| s.external_id.eq_ignore_ascii_case(external_id))
                .cloned()
        }

        pub fn mode_names(&self) -> Vec<String> {
            self.tables
                .lock()
                .unwrap()
                .modes
                .values()
                .map(|m| m.name.clone())
                .collect()
        }
    }

    fn check_unique(tables: &Tables, station: &Station) -> Result<()> {
        let clash = tables.stations.values().any(|other| {
            other.id != station.id && other.external_id.eq_ignore_ascii_case(&station.external_id)
        });
        if clash {
            return Err(AppError::Conflict(format!(
                "Unique constraint violation: stations.external_id ({})",
                station.external_id
            )));
        }
        if let Some(missing) = station
            .transport_mode_ids
            .iter()
            .find(|id| !tables.modes.contains_key(id))
        {
            return Err(AppError::Database(format!(
                "Foreign key constraint violation: station_transport_modes.transport_mode_id ({})",
                missing
            )));
        }
        Ok(())
    }

    #[async_trait]
    impl StationRepository for InMemoryStationRepository {
        async fn list_stations(&self) -> Result<Vec<Station>> {
            Ok(self.tables.lock().unwrap().stations.values().cloned().collect())
        }

        async fn list_transport_modes(&self) -> Result<Vec<TransportMode>> {
            Ok(self.tables.lock().unwrap().modes.values().cloned().collect())
        }

        async fn apply(&self, changes: &StationChanges) -> Result<()> {
            let mut tables = self.tables.lock().unwrap();
            let mut working = tables.clone();

            for mode in &changes.new_modes {
                if working.modes.values().any(|m| m.name.eq_ignore_ascii_case(&mode.name)) {
                    return Err(AppError::Conflict(format!(
                        "Unique constraint violation: transport_modes.name ({})",
                        mode.name
                    )));
                }
                working.modes.insert(mode.id, mode.clone());
            }
            for station in &changes.inserted {
                check_unique(&working, station)?;
                working.stations.insert(station.id, station.clone());
            }
            for station in &changes.updated {
                if !working.stations.contains_key(&station.id) {
                    return Err(AppError::NotFound(format!("stations row {} not found", station.id)));
                }
                check_unique(&working, station)?;
                working.stations.insert(station.id, station.clone());
            }

            *tables = working;
            if !changes.is_empty() {
                self.applies.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }
    }
}
