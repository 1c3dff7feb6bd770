//! Station reference data refreshed from the operator's list into SQLite

mod common;

use chrono::Duration;
use common::Harness;
use transit_core::application::CommandHandler;
use transit_core::domain::BackgroundCommand;
use transit_core::port::station_source::mocks::station;
use transit_core::port::StationRepository;

async fn sync(h: &Harness) {
    h.commands
        .execute(&BackgroundCommand::SyncStations)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_station_sync_inserts_updates_and_skips_unchanged() {
    let h = Harness::new().await;
    h.station_source.set(vec![
        station("GT-SAN", "Sandton", 28.0567, -26.1076, &["Train", "Bus"]),
        station("GT-HAT", "Hatfield", 28.2381, -25.7479, &["Train"]),
    ]);
    sync(&h).await;

    let stations = h.station_repository.list_stations().await.unwrap();
    assert_eq!(stations.len(), 2);
    let modes = h.station_repository.list_transport_modes().await.unwrap();
    let names: Vec<&str> = modes.iter().map(|m| m.name.as_str()).collect();
    assert_eq!(names, vec!["BUS", "TRAIN"]);

    // Same list again: nothing is rewritten
    h.time.advance(Duration::hours(1));
    sync(&h).await;
    assert_eq!(h.station_repository.list_stations().await.unwrap(), stations);

    h.time.advance(Duration::hours(1));
    h.station_source.set(vec![
        station("gt-san", "Sandton Central", 28.0567, -26.1076, &["Train"]),
        station("GT-HAT", "Hatfield", 28.2381, -25.7479, &["Train"]),
        station("GT-ROS", "Rosebank", 28.0436, -26.1456, &["Train"]),
    ]);
    sync(&h).await;

    let after = h.station_repository.list_stations().await.unwrap();
    assert_eq!(after.len(), 3);

    let sandton = after.iter().find(|s| s.external_id == "GT-SAN").unwrap();
    let original = stations.iter().find(|s| s.external_id == "GT-SAN").unwrap();
    assert_eq!(sandton.id, original.id);
    assert_eq!(sandton.name, "Sandton Central");
    assert_eq!(sandton.transport_mode_ids.len(), 1);
    assert!(sandton.updated_at > original.updated_at);

    let hatfield = after.iter().find(|s| s.external_id == "GT-HAT").unwrap();
    let hatfield_before = stations.iter().find(|s| s.external_id == "GT-HAT").unwrap();
    assert_eq!(hatfield, hatfield_before);
}

#[tokio::test]
async fn test_stations_missing_upstream_are_kept() {
    let h = Harness::new().await;
    h.station_source.set(vec![station("GT-PARK", "Park", 28.0421, -26.1952, &[])]);
    sync(&h).await;

    h.station_source.set(vec![]);
    sync(&h).await;

    let stations = h.station_repository.list_stations().await.unwrap();
    assert_eq!(stations.len(), 1);
    assert_eq!(stations[0].name, "Park");
}

#[tokio::test]
async fn test_unavailable_station_list_is_retried_by_the_worker() {
    let h = Harness::new().await;
    h.station_source.set(vec![station("GT-PARK", "Park", 28.0421, -26.1952, &[])]);
    h.station_source.set_unavailable(true);
    h.scheduler
        .schedule_recurring("sync-stations", BackgroundCommand::SyncStations, "1 * * * *")
        .await
        .unwrap();

    h.time.advance(Duration::hours(1));
    assert_eq!(h.worker.fire_due_recurring().await.unwrap(), 1);
    assert_eq!(h.run_jobs().await, 1);
    assert!(h.station_repository.list_stations().await.unwrap().is_empty());

    h.station_source.set_unavailable(false);
    h.time.advance(Duration::minutes(2));
    assert_eq!(h.run_jobs().await, 1);
    assert_eq!(h.station_repository.list_stations().await.unwrap().len(), 1);
}
