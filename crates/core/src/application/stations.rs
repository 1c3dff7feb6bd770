// Station Sync - mirror the operator's station list into local reference data
//
// Upserts by external id (ignoring case). Stations the upstream stops listing are kept.

use crate::domain::{Station, TransportMode};
use crate::error::Result;
use crate::port::{
    IdProvider, StationChanges, StationRepository, StationSource, TimeProvider, UpstreamStation,
};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StationSyncReport {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub new_modes: usize,
}

pub struct StationSyncService {
    source: Arc<dyn StationSource>,
    repository: Arc<dyn StationRepository>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl StationSyncService {
    pub fn new(
        source: Arc<dyn StationSource>,
        repository: Arc<dyn StationRepository>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            source,
            repository,
            id_provider,
            time_provider,
        }
    }

    pub async fn sync(&self) -> Result<StationSyncReport> {
        let (upstream, existing, modes) = tokio::try_join!(
            self.source.fetch_stations(),
            self.repository.list_stations(),
            self.repository.list_transport_modes(),
        )?;

        let mut changes = StationChanges::default();
        let mut report = StationSyncReport::default();
        let mode_ids = self.resolve_modes(&upstream, modes, &mut changes)?;

        let now = self.time_provider.now();
        let mut by_external_id: HashMap<String, Station> = existing
            .into_iter()
            .map(|s| (s.external_id.to_lowercase(), s))
            .collect();
        let mut seen = HashSet::new();

        for listed in &upstream {
            let key = listed.id.trim().to_lowercase();
            if !seen.insert(key.clone()) {
                warn!(external_id = %listed.id, "Station listed twice upstream, keeping the first");
                report.skipped += 1;
                continue;
            }

            let served: BTreeSet<Uuid> = listed
                .modes
                .iter()
                .filter_map(|m| mode_ids.get(&TransportMode::normalize(m)).copied())
                .collect();

            match by_external_id.remove(&key) {
                Some(mut station) => {
                    let renamed = match station.rename(&listed.name, now) {
                        Ok(renamed) => renamed,
                        Err(e) => {
                            warn!(external_id = %listed.id, error = %e, "Keeping station name");
                            false
                        }
                    };
                    let moved = station.relocate(listed.location(), now);
                    let remoded = station.set_transport_modes(served);

                    if renamed || moved || remoded {
                        changes.updated.push(station);
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                None => {
                    let created = Station::create(
                        self.id_provider.generate_id(),
                        &listed.id,
                        &listed.name,
                        listed.location(),
                        now,
                    );
                    match created {
                        Ok(mut station) => {
                            station.transport_mode_ids = served;
                            changes.inserted.push(station);
                            report.inserted += 1;
                        }
                        Err(e) => {
                            warn!(external_id = %listed.id, error = %e, "Skipping invalid station");
                            report.skipped += 1;
                        }
                    }
                }
            }
        }

        report.new_modes = changes.new_modes.len();
        if !changes.is_empty() {
            self.repository.apply(&changes).await?;
        }

        info!(
            inserted = report.inserted,
            updated = report.updated,
            unchanged = report.unchanged,
            skipped = report.skipped,
            new_modes = report.new_modes,
            "Station sync complete"
        );
        Ok(report)
    }

    /// Mode id by normalized name, creating modes the upstream introduced
    fn resolve_modes(
        &self,
        upstream: &[UpstreamStation],
        existing: Vec<TransportMode>,
        changes: &mut StationChanges,
    ) -> Result<HashMap<String, Uuid>> {
        let mut ids: HashMap<String, Uuid> = existing
            .into_iter()
            .map(|m| (TransportMode::normalize(&m.name), m.id))
            .collect();

        for name in upstream.iter().flat_map(|s| s.modes.iter()) {
            let key = TransportMode::normalize(name);
            if key.is_empty() || ids.contains_key(&key) {
                continue;
            }
            let mode = TransportMode::create(self.id_provider.generate_id(), &key)?;
            ids.insert(key, mode.id);
            changes.new_modes.push(mode);
        }
        Ok(ids)
    }
}
