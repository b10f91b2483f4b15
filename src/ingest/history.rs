/// Historical sensor readings from PostgreSQL
///
/// When `training.source = "database"`, the training table is read from the
/// `sensor_readings` table instead of being generated. Rows come back
/// oldest-first, since the time axis is the row order of a raw table.

use chrono::{DateTime, Utc};
use postgres::{Client, NoTls};

use crate::features::validate_table;
use crate::model::{ForecastError, RawReading, RawTable};

/// Open a connection to the readings store.
pub fn connect(database_url: &str) -> Result<Client, ForecastError> {
    Client::connect(database_url, NoTls)
        .map_err(|e| ForecastError::Ingest(format!("connect failed: {}", e)))
}

/// Load the most recent `limit` hourly readings for a station.
///
/// Returns readings in ascending time order. Fails if any stored value
/// violates the reading data model (negative rainfall, NaN level, ...).
pub fn load_readings(
    client: &mut Client,
    station_id: &str,
    limit: usize,
) -> Result<RawTable, ForecastError> {
    let limit = i64::try_from(limit).unwrap_or(i64::MAX);

    let query = "
        SELECT rainfall_mm, discharge_cumec, water_level_m
        FROM (
            SELECT measurement_time, rainfall_mm, discharge_cumec, water_level_m
            FROM sensor_readings
            WHERE station_id = $1
            ORDER BY measurement_time DESC
            LIMIT $2
        ) recent
        ORDER BY measurement_time ASC
    ";

    let rows = client
        .query(query, &[&station_id, &limit])
        .map_err(|e| ForecastError::Ingest(format!("query failed for {}: {}", station_id, e)))?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let column = |index: usize| -> Result<f64, ForecastError> {
            row.try_get::<_, f64>(index)
                .map_err(|e| ForecastError::Ingest(format!("column {}: {}", index, e)))
        };
        columns.push((column(0)?, column(1)?, column(2)?));
    }
    to_readings(columns)
}

/// Get the stored time range for a station, if it has any readings.
pub fn get_data_range(
    client: &mut Client,
    station_id: &str,
) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>, ForecastError> {
    let row = client
        .query_one(
            "SELECT MIN(measurement_time), MAX(measurement_time)
             FROM sensor_readings
             WHERE station_id = $1",
            &[&station_id],
        )
        .map_err(|e| ForecastError::Ingest(e.to_string()))?;

    let min: Option<DateTime<Utc>> = row
        .try_get(0)
        .map_err(|e| ForecastError::Ingest(e.to_string()))?;
    let max: Option<DateTime<Utc>> = row
        .try_get(1)
        .map_err(|e| ForecastError::Ingest(e.to_string()))?;

    match (min, max) {
        (Some(start), Some(end)) => Ok(Some((start, end))),
        _ => Ok(None),
    }
}

/// Build a validated raw table from `(rainfall, discharge, water_level)`
/// columns.
pub fn to_readings(columns: Vec<(f64, f64, f64)>) -> Result<RawTable, ForecastError> {
    let table: RawTable = columns
        .into_iter()
        .map(|(rainfall, discharge, water_level)| RawReading::new(rainfall, discharge, water_level))
        .collect();
    validate_table(&table, 0)?;
    Ok(table)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_readings_keeps_order() {
        let table = to_readings(vec![(1.0, 2.0, 3.0), (4.0, 5.0, 6.0)]).unwrap();
        assert_eq!(table[0], RawReading::new(1.0, 2.0, 3.0));
        assert_eq!(table[1], RawReading::new(4.0, 5.0, 6.0));
    }

    #[test]
    fn test_to_readings_rejects_negative_discharge() {
        let err = to_readings(vec![(1.0, 2.0, 3.0), (1.0, -2.0, 3.0)]).unwrap_err();
        assert!(matches!(
            err,
            ForecastError::InvalidReading {
                position: 1,
                field: "discharge",
                ..
            }
        ));
    }
}
