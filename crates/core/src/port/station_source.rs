// Station Source Port
// The operator's public station list

use crate::domain::GeoPoint;
use crate::error::Result;
use async_trait::async_trait;
use serde::Deserialize;

/// One station as the operator publishes it
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamStation {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub geometry: UpstreamGeometry,
    #[serde(default)]
    pub modes: Vec<String>,
}

/// GeoJSON-style point: `[longitude, latitude]`
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct UpstreamGeometry {
    #[serde(default)]
    pub coordinates: Vec<f64>,
}

impl UpstreamStation {
    /// Missing coordinates read as 0
    pub fn location(&self) -> GeoPoint {
        let coordinate = |i: usize| self.geometry.coordinates.get(i).copied().unwrap_or(0.0);
        GeoPoint::new(coordinate(0), coordinate(1))
    }
}

#[async_trait]
pub trait StationSource: Send + Sync {
    async fn fetch_stations(&self) -> Result<Vec<UpstreamStation>>;
}

pub mod mocks {
    use super::*;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    pub fn station(id: &str, name: &str, longitude: f64, latitude: f64, modes: &[&str]) -> UpstreamStation {
        UpstreamStation {
            id: id.to_string(),
            name: name.to_string(),
            geometry: UpstreamGeometry {
                coordinates: vec![longitude, latitude],
            },
            modes: modes.iter().map(|m| m.to_string()).collect(),
        }
    }

    /// Serves whatever list was last set
    #[derive(Default)]
    pub struct StaticStationSource {
        stations: Mutex<Vec<UpstreamStation>>,
        unavailable: AtomicBool,
    }

    impl StaticStationSource {
        pub fn new(stations: Vec<UpstreamStation>) -> Self {
            Self {
                stations: Mutex::new(stations),
                unavailable: AtomicBool::new(false),
            }
        }

        pub fn set(&self, stations: Vec<UpstreamStation>) {
            *self.stations.lock().unwrap() = stations;
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl StationSource for StaticStationSource {
        async fn fetch_stations(&self) -> Result<Vec<UpstreamStation>> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(AppError::Execution("station list unavailable".to_string()));
            }
            Ok(self.stations.lock().unwrap().clone())
        }
    }
}
