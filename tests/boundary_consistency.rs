/// Partition-boundary behaviour of distributed feature engineering.
///
/// With a carried halo the partitioned result must equal the single-table
/// result exactly. Without one, only the rows that lack trailing history
/// inside their own partition may differ, and they differ by being absent.
use flomon_forecast::features::engineer_features;
use flomon_forecast::features::partition::{
    Halo, WorkerPool, engineer_distributed, engineer_partitioned, plan_partitions,
};
use flomon_forecast::model::{EngineeredRow, MIN_TRAILING_HISTORY, RawReading};
use flomon_forecast::synthetic::generate_readings;

// ---------------------------------------------------------------------------
// Test Helpers
// ---------------------------------------------------------------------------

fn table() -> Vec<RawReading> {
    generate_readings(200, 17)
}

fn positions(rows: &[EngineeredRow]) -> Vec<usize> {
    rows.iter().map(|r| r.position).collect()
}

// ---------------------------------------------------------------------------
// Carry
// ---------------------------------------------------------------------------

#[test]
fn test_carried_halo_matches_single_table() {
    let table = table();
    let single = engineer_features(&table).expect("valid table");
    let pool = WorkerPool::new(2);
    let split = engineer_distributed(&table, 2, Halo::Carry, &pool).expect("valid table");

    assert_eq!(single.len(), 200 - MIN_TRAILING_HISTORY);
    assert_eq!(split, single, "carried halo must be identical to one pass");
}

#[test]
fn test_carried_halo_ignores_worker_and_partition_count() {
    let table = table();
    let single = engineer_features(&table).expect("valid table");
    for workers in [1, 3] {
        for count in [2, 5, 9] {
            let rows = engineer_distributed(&table, count, Halo::Carry, &WorkerPool::new(workers))
                .expect("valid table");
            assert_eq!(rows, single, "{} partitions on {} workers", count, workers);
        }
    }
}

// ---------------------------------------------------------------------------
// Discard
// ---------------------------------------------------------------------------

#[test]
fn test_discarded_halo_differs_only_near_the_boundary() {
    let table = table();
    let single = engineer_features(&table).expect("valid table");
    let plan = plan_partitions(table.len(), 2);
    assert_eq!(plan[1].start, 100);

    let split = engineer_partitioned(&table, &plan, Halo::Discard, &WorkerPool::new(2))
        .expect("valid table");

    let boundary = 100..100 + MIN_TRAILING_HISTORY;
    let expected: Vec<&EngineeredRow> = single
        .iter()
        .filter(|row| !boundary.contains(&row.position))
        .collect();
    let got: Vec<&EngineeredRow> = split.iter().collect();
    assert_eq!(got, expected, "rows away from the boundary must be unchanged");

    let missing: Vec<usize> = positions(&single)
        .into_iter()
        .filter(|p| !positions(&split).contains(p))
        .collect();
    assert_eq!(missing, boundary.collect::<Vec<_>>());
}

#[test]
fn test_invalid_reading_position_is_reported_against_the_whole_table() {
    let mut table = table();
    table[150].rainfall = -1.0;
    let err = engineer_distributed(&table, 2, Halo::Carry, &WorkerPool::new(2)).unwrap_err();
    assert!(
        matches!(err, flomon_forecast::model::ForecastError::InvalidReading { position: 150, .. }),
        "got {:?}",
        err
    );
}
