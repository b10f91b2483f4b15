/// Live tests against a PostgreSQL store of hourly sensor readings.
///
/// Prerequisites:
/// - PostgreSQL with a `sensor_readings` table
///   (station_id, measurement_time, rainfall_mm, discharge_cumec, water_level_m)
/// - DATABASE_URL set in the environment or .env
///
/// Run with: cargo test --test history_ingest -- --ignored --test-threads=1
use chrono::{Duration, Utc};
use postgres::Client;

use flomon_forecast::ingest::history;

const STATION: &str = "TEST_HISTORY";

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn get_test_client() -> Client {
    dotenv::dotenv().ok();
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    history::connect(&url).expect("database reachable")
}

fn cleanup_test_data(client: &mut Client) {
    let _ = client.execute("DELETE FROM sensor_readings WHERE station_id = $1", &[&STATION]);
}

fn insert_hours(client: &mut Client, hours: i64) {
    let start = Utc::now() - Duration::hours(hours);
    for hour in 0..hours {
        client
            .execute(
                "INSERT INTO sensor_readings
                 (station_id, measurement_time, rainfall_mm, discharge_cumec, water_level_m)
                 VALUES ($1, $2, $3, $4, $5)",
                &[
                    &STATION,
                    &(start + Duration::hours(hour)),
                    &(hour as f64),
                    &30.0f64,
                    &2.0f64,
                ],
            )
            .expect("insert test reading");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
#[ignore]
fn test_load_readings_returns_newest_rows_oldest_first() {
    let mut client = get_test_client();
    cleanup_test_data(&mut client);
    insert_hours(&mut client, 48);

    let readings = history::load_readings(&mut client, STATION, 24).expect("query succeeds");
    assert_eq!(readings.len(), 24);
    let rainfall: Vec<f64> = readings.iter().map(|r| r.rainfall).collect();
    assert_eq!(rainfall, (24..48).map(|h| h as f64).collect::<Vec<_>>());

    cleanup_test_data(&mut client);
}

#[test]
#[ignore]
fn test_data_range_covers_inserted_hours() {
    let mut client = get_test_client();
    cleanup_test_data(&mut client);
    assert!(history::get_data_range(&mut client, STATION).expect("query").is_none());

    insert_hours(&mut client, 10);
    let (first, last) = history::get_data_range(&mut client, STATION)
        .expect("query")
        .expect("rows exist");
    assert_eq!(last - first, Duration::hours(9));

    cleanup_test_data(&mut client);
}
