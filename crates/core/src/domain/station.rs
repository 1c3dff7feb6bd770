// Station and Transport Mode Entities
// Reference data mirrored from the operator's station list

use crate::domain::error::{DomainError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub const MAX_EXTERNAL_ID_LENGTH: usize = 64;
pub const MAX_STATION_NAME_LENGTH: usize = 32;
pub const MAX_MODE_NAME_LENGTH: usize = 32;

/// Coordinates closer than this (in degrees) are the same location
pub const LOCATION_TOLERANCE: f64 = 0.000001;

/// WGS84 point
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub longitude: f64,
    pub latitude: f64,
}

impl GeoPoint {
    pub fn new(longitude: f64, latitude: f64) -> Self {
        Self {
            longitude,
            latitude,
        }
    }

    pub fn approx_eq(&self, other: &GeoPoint) -> bool {
        (self.longitude - other.longitude).abs() < LOCATION_TOLERANCE
            && (self.latitude - other.latitude).abs() < LOCATION_TOLERANCE
    }
}

/// A way of travelling a station serves ("TRAIN", "BUS")
///
/// Names are stored upper-cased and are unique ignoring case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMode {
    pub id: Uuid,
    pub name: String,
}

impl TransportMode {
    pub fn create(id: Uuid, name: &str) -> Result<Self> {
        let name = Self::normalize(name);
        if name.is_empty() {
            return Err(DomainError::Validation(
                "Transport mode name cannot be empty.".to_string(),
            ));
        }
        if name.chars().count() > MAX_MODE_NAME_LENGTH {
            return Err(DomainError::Validation(format!(
                "Transport mode name cannot exceed {} characters.",
                MAX_MODE_NAME_LENGTH
            )));
        }
        Ok(Self { id, name })
    }

    /// Lookup key for a mode name as the upstream spells it
    pub fn normalize(name: &str) -> String {
        name.trim().to_uppercase()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub id: Uuid,
    /// Upstream identifier, unique ignoring case
    pub external_id: String,
    pub name: String,
    pub location: GeoPoint,
    pub transport_mode_ids: BTreeSet<Uuid>,
    pub updated_at: DateTime<Utc>,
}

fn validate_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(DomainError::Validation("Station name cannot be empty.".to_string()));
    }
    if name.chars().count() > MAX_STATION_NAME_LENGTH {
        return Err(DomainError::Validation(format!(
            "Station name cannot exceed {} characters.",
            MAX_STATION_NAME_LENGTH
        )));
    }
    Ok(())
}

impl Station {
    pub fn create(
        id: Uuid,
        external_id: &str,
        name: &str,
        location: GeoPoint,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(DomainError::Validation(
                "Station external id cannot be empty.".to_string(),
            ));
        }
        if external_id.chars().count() > MAX_EXTERNAL_ID_LENGTH {
            return Err(DomainError::Validation(format!(
                "Station external id cannot exceed {} characters.",
                MAX_EXTERNAL_ID_LENGTH
            )));
        }
        validate_name(name)?;

        Ok(Self {
            id,
            external_id: external_id.to_string(),
            name: name.to_string(),
            location,
            transport_mode_ids: BTreeSet::new(),
            updated_at: now,
        })
    }

    /// Returns whether the name changed
    pub fn rename(&mut self, name: &str, now: DateTime<Utc>) -> Result<bool> {
        if self.name == name {
            return Ok(false);
        }
        validate_name(name)?;
        self.name = name.to_string();
        self.updated_at = now;
        Ok(true)
    }

    /// Returns whether the station moved beyond [`LOCATION_TOLERANCE`]
    pub fn relocate(&mut self, location: GeoPoint, now: DateTime<Utc>) -> bool {
        if self.location.approx_eq(&location) {
            return false;
        }
        self.location = location;
        self.updated_at = now;
        true
    }

    /// Replace the served modes; returns whether the set changed
    pub fn set_transport_modes(&mut self, mode_ids: BTreeSet<Uuid>) -> bool {
        if self.transport_mode_ids == mode_ids {
            return false;
        }
        self.transport_mode_ids = mode_ids;
        true
    }
}
