//! Feature engineering over raw reading tables.
//!
//! One pure function turns a raw table into engineered rows. The training
//! path runs it per partition on a worker pool (see [`partition`]); the
//! real-time path runs it on a single in-memory snapshot. Both must agree
//! bit for bit, so every rolling statistic is recomputed from its own
//! trailing slice in a fixed order. No running sums are carried between
//! rows, which would make the result depend on where a partition starts.
//!
//! Rows without [`MIN_TRAILING_HISTORY`] prior readings are dropped.

pub mod partition;

use crate::model::{
    DIFF_OFFSET, EngineeredRow, FeatureVector, ForecastError, LAG_OFFSET, MIN_TRAILING_HISTORY,
    ROLLING_MEAN_WINDOW, ROLLING_SUM_WINDOW, RawReading,
};

/// Engineers every row of `table` that has enough trailing history.
///
/// Output positions index into `table`. A table shorter than
/// [`ROLLING_SUM_WINDOW`] yields an empty result, not an error. Invalid
/// readings anywhere in the table are an error.
pub fn engineer_features(table: &[RawReading]) -> Result<Vec<EngineeredRow>, ForecastError> {
    validate_table(table, 0)?;
    Ok((MIN_TRAILING_HISTORY..table.len())
        .map(|position| EngineeredRow {
            position,
            features: features_at(table, position),
        })
        .collect())
}

/// Engineers only the newest row of `table`.
///
/// Equal to the last row of [`engineer_features`] on the same table; only
/// the trailing [`ROLLING_SUM_WINDOW`] readings are read or validated.
pub fn latest_features(table: &[RawReading]) -> Result<FeatureVector, ForecastError> {
    if table.len() < ROLLING_SUM_WINDOW {
        return Err(ForecastError::InsufficientHistory {
            required: ROLLING_SUM_WINDOW,
            available: table.len(),
        });
    }
    let start = table.len() - ROLLING_SUM_WINDOW;
    validate_table(&table[start..], start)?;
    Ok(features_at(table, table.len() - 1))
}

/// Checks every reading; `offset` is added to reported positions.
pub fn validate_table(table: &[RawReading], offset: usize) -> Result<(), ForecastError> {
    table
        .iter()
        .enumerate()
        .try_for_each(|(i, reading)| reading.validate(offset + i))
}

/// Feature vector at `position`. Caller guarantees
/// `position >= MIN_TRAILING_HISTORY`.
fn features_at(table: &[RawReading], position: usize) -> FeatureVector {
    let current = &table[position];

    let sum_window = &table[position + 1 - ROLLING_SUM_WINDOW..=position];
    let rainfall_24h_sum = sum_window.iter().map(|r| r.rainfall).sum::<f64>();

    let mean_window = &table[position + 1 - ROLLING_MEAN_WINDOW..=position];
    let water_level_6h_avg =
        mean_window.iter().map(|r| r.water_level).sum::<f64>() / ROLLING_MEAN_WINDOW as f64;

    FeatureVector {
        rainfall: current.rainfall,
        discharge: current.discharge,
        water_level: current.water_level,
        rainfall_24h_sum,
        water_level_6h_avg,
        water_level_diff_1h: current.water_level - table[position - DIFF_OFFSET].water_level,
        discharge_lag_3h: table[position - LAG_OFFSET].discharge,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// Readings whose fields encode their own position, so every engineered
    /// statistic has a closed form.
    fn ramp(n: usize) -> Vec<RawReading> {
        (0..n)
            .map(|i| RawReading::new(i as f64, 10.0 * i as f64, 0.5 * i as f64))
            .collect()
    }

    #[test]
    fn test_thirty_rows_engineer_to_seven() {
        let rows = engineer_features(&ramp(30)).expect("valid table");
        assert_eq!(rows.len(), 30 - 23, "rows 0..=22 must be dropped, not filled");
        assert_eq!(rows[0].position, 23);
        assert_eq!(rows.last().map(|r| r.position), Some(29));
    }

    #[test]
    fn test_short_table_yields_no_rows() {
        let rows = engineer_features(&ramp(23)).expect("short table is not an error");
        assert!(rows.is_empty());

        let rows = engineer_features(&ramp(24)).expect("valid table");
        assert_eq!(rows.len(), 1, "24 readings define exactly one row");
    }

    #[test]
    fn test_feature_values_match_closed_form() {
        let table = ramp(40);
        let rows = engineer_features(&table).expect("valid table");
        let row = rows.iter().find(|r| r.position == 30).expect("position 30 engineered");
        let f = row.features;

        // rainfall = i, so the 24h sum over 7..=30 is sum(7..=30) = 444.
        assert_eq!(f.rainfall, 30.0);
        assert_eq!(f.rainfall_24h_sum, (7..=30).sum::<usize>() as f64);
        // water_level = i/2, mean over 25..=30 is 27.5/2.
        assert_eq!(f.water_level_6h_avg, 13.75);
        assert_eq!(f.water_level_diff_1h, 0.5);
        // discharge = 10i, lagged 3 rows.
        assert_eq!(f.discharge_lag_3h, 270.0);
    }

    #[test]
    fn test_engineering_is_deterministic() {
        let table: Vec<RawReading> = (0..200)
            .map(|i| {
                let x = i as f64;
                RawReading::new((x * 0.37).sin().abs() * 30.0, x.cos().abs() * 60.0, 1.5 + (x * 0.11).sin())
            })
            .collect();
        let first = engineer_features(&table).expect("valid table");
        let second = engineer_features(&table).expect("valid table");
        assert_eq!(first, second);
    }

    #[test]
    fn test_latest_features_equals_last_engineered_row() {
        let table: Vec<RawReading> = (0..100)
            .map(|i| RawReading::new((i % 7) as f64 * 1.3, (i % 11) as f64 * 2.1, 2.0 + (i % 5) as f64 * 0.07))
            .collect();
        let all = engineer_features(&table).expect("valid table");
        let latest = latest_features(&table).expect("enough history");
        assert_eq!(Some(latest), all.last().map(|r| r.features));
    }

    #[test]
    fn test_latest_features_requires_24_readings() {
        let err = latest_features(&ramp(23)).unwrap_err();
        assert_eq!(
            err,
            ForecastError::InsufficientHistory {
                required: 24,
                available: 23
            }
        );
    }

    #[test]
    fn test_invalid_reading_is_surfaced_with_position() {
        let mut table = ramp(30);
        table[12].discharge = f64::NAN;
        let err = engineer_features(&table).unwrap_err();
        assert!(
            matches!(err, ForecastError::InvalidReading { position: 12, field: "discharge", .. }),
            "NaN must not be silently engineered, got {:?}",
            err
        );
    }

    #[test]
    fn test_latest_features_ignores_readings_outside_its_window() {
        // Row 0 is outside the trailing 24, so it cannot influence the result.
        let mut table = ramp(50);
        table[0].rainfall = -5.0;
        assert!(latest_features(&table).is_ok());

        table[40].rainfall = -5.0;
        let err = latest_features(&table).unwrap_err();
        assert!(matches!(err, ForecastError::InvalidReading { position: 40, .. }));
    }
}
