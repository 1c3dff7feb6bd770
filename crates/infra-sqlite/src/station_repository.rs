// SQLite StationRepository Implementation

use crate::error::{corrupt_row, map_sqlx_error};
use async_trait::async_trait;
use chrono::DateTime;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::{BTreeSet, HashMap};
use transit_core::domain::{GeoPoint, Station, TransportMode};
use transit_core::error::{AppError, Result};
use transit_core::port::{StationChanges, StationRepository};
use uuid::Uuid;

pub struct SqliteStationRepository {
    pool: SqlitePool,
}

impl SqliteStationRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct StationRow {
    id: String,
    external_id: String,
    name: String,
    longitude: f64,
    latitude: f64,
    updated_at: i64,
}

impl StationRow {
    fn into_station(self, transport_mode_ids: BTreeSet<Uuid>) -> Result<Station> {
        let id = Uuid::parse_str(&self.id).map_err(|e| corrupt_row("stations", &self.id, e))?;
        let updated_at = DateTime::from_timestamp_millis(self.updated_at).ok_or_else(|| {
            corrupt_row(
                "stations",
                &self.id,
                format!("timestamp {} out of range", self.updated_at),
            )
        })?;

        Ok(Station {
            id,
            external_id: self.external_id,
            name: self.name,
            location: GeoPoint::new(self.longitude, self.latitude),
            transport_mode_ids,
            updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct TransportModeRow {
    id: String,
    name: String,
}

async fn insert_station(tx: &mut Transaction<'_, Sqlite>, station: &Station) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO stations (id, external_id, name, longitude, latitude, updated_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(station.id.to_string())
    .bind(&station.external_id)
    .bind(&station.name)
    .bind(station.location.longitude)
    .bind(station.location.latitude)
    .bind(station.updated_at.timestamp_millis())
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn update_station(tx: &mut Transaction<'_, Sqlite>, station: &Station) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE stations
        SET external_id = ?, name = ?, longitude = ?, latitude = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&station.external_id)
    .bind(&station.name)
    .bind(station.location.longitude)
    .bind(station.location.latitude)
    .bind(station.updated_at.timestamp_millis())
    .bind(station.id.to_string())
    .execute(&mut **tx)
    .await
    .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("stations row {} not found", station.id)));
    }
    Ok(())
}

/// Replace the station's mode links with its current set
async fn link_modes(tx: &mut Transaction<'_, Sqlite>, station: &Station) -> Result<()> {
    sqlx::query("DELETE FROM station_transport_modes WHERE station_id = ?")
        .bind(station.id.to_string())
        .execute(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

    for mode_id in &station.transport_mode_ids {
        sqlx::query("INSERT INTO station_transport_modes (station_id, transport_mode_id) VALUES (?, ?)")
            .bind(station.id.to_string())
            .bind(mode_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(map_sqlx_error)?;
    }
    Ok(())
}

#[async_trait]
impl StationRepository for SqliteStationRepository {
    async fn list_stations(&self) -> Result<Vec<Station>> {
        let rows = sqlx::query_as::<_, StationRow>("SELECT * FROM stations ORDER BY external_id")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let links: Vec<(String, String)> =
            sqlx::query_as("SELECT station_id, transport_mode_id FROM station_transport_modes")
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx_error)?;

        let mut modes_by_station: HashMap<String, BTreeSet<Uuid>> = HashMap::new();
        for (station_id, mode_id) in links {
            let mode_id = Uuid::parse_str(&mode_id)
                .map_err(|e| corrupt_row("station_transport_modes", &station_id, e))?;
            modes_by_station.entry(station_id).or_default().insert(mode_id);
        }

        rows.into_iter()
            .map(|row| {
                let modes = modes_by_station.remove(&row.id).unwrap_or_default();
                row.into_station(modes)
            })
            .collect()
    }

    async fn list_transport_modes(&self) -> Result<Vec<TransportMode>> {
        let rows = sqlx::query_as::<_, TransportModeRow>("SELECT * FROM transport_modes ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        rows.into_iter()
            .map(|row| {
                let id = Uuid::parse_str(&row.id).map_err(|e| corrupt_row("transport_modes", &row.id, e))?;
                Ok(TransportMode { id, name: row.name })
            })
            .collect()
    }

    async fn apply(&self, changes: &StationChanges) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        for mode in &changes.new_modes {
            sqlx::query("INSERT INTO transport_modes (id, name) VALUES (?, ?)")
                .bind(mode.id.to_string())
                .bind(&mode.name)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }
        for station in &changes.inserted {
            insert_station(&mut tx, station).await?;
            link_modes(&mut tx, station).await?;
        }
        for station in &changes.updated {
            update_station(&mut tx, station).await?;
            link_modes(&mut tx, station).await?;
        }

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }
}
