//! Fixed-length windows of raw readings for the temporal model.
//!
//! A window is `sequence_length` consecutive readings of the three raw
//! fields. For training, every window is paired with the label of its
//! final row, so a table of `n` rows yields `n - sequence_length + 1`
//! windows. At inference only the trailing window is needed.

use crate::model::{ForecastError, RAW_FIELD_COUNT, RawReading};
use crate::scaler::StandardScaler;

/// One time step of a window: rainfall, discharge, water level.
pub type SequenceRow = [f64; RAW_FIELD_COUNT];

/// Raw fields of every reading, in table order.
pub fn raw_rows(table: &[RawReading]) -> Vec<SequenceRow> {
    table.iter().map(RawReading::as_array).collect()
}

/// Borrowed overlapping windows over `series` and their aligned labels.
///
/// The label of a window is the label of its last row.
pub fn training_windows<'a>(
    series: &'a [SequenceRow],
    labels: &[u8],
    sequence_length: usize,
) -> Result<(Vec<&'a [SequenceRow]>, Vec<u8>), ForecastError> {
    if labels.len() != series.len() {
        return Err(ForecastError::TrainingDataShape {
            expected: format!("{} labels", series.len()),
            found: format!("{} labels", labels.len()),
        });
    }
    if sequence_length == 0 || series.len() < sequence_length {
        return Err(ForecastError::InsufficientHistory {
            required: sequence_length.max(1),
            available: series.len(),
        });
    }

    let windows: Vec<&[SequenceRow]> = series.windows(sequence_length).collect();
    let aligned = labels[sequence_length - 1..].to_vec();
    Ok((windows, aligned))
}

/// The newest `sequence_length` readings of `table`, scaled with the
/// temporal model's fitted `scaler`.
pub fn last_window(
    table: &[RawReading],
    sequence_length: usize,
    scaler: &StandardScaler,
) -> Result<Vec<SequenceRow>, ForecastError> {
    if sequence_length == 0 || table.len() < sequence_length {
        return Err(ForecastError::InsufficientHistory {
            required: sequence_length.max(1),
            available: table.len(),
        });
    }
    let start = table.len() - sequence_length;
    table[start..]
        .iter()
        .enumerate()
        .map(|(i, reading)| {
            reading.validate(start + i)?;
            scaler.transform(&reading.as_array())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity_scaler() -> StandardScaler {
        StandardScaler {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        }
    }

    fn table(n: usize) -> Vec<RawReading> {
        (0..n).map(|i| RawReading::new(i as f64, 2.0 * i as f64, 1.0)).collect()
    }

    #[test]
    fn test_window_labels_align_to_final_row() {
        let series = raw_rows(&table(10));
        let labels: Vec<u8> = (0..10).map(|i| u8::from(i % 3 == 0)).collect();
        let (windows, aligned) = training_windows(&series, &labels, 4).expect("enough rows");

        assert_eq!(windows.len(), 10 - 4 + 1);
        assert_eq!(aligned.len(), windows.len());
        for (w, (window, label)) in windows.iter().zip(&aligned).enumerate() {
            assert_eq!(window.len(), 4);
            let last_row = w + 3;
            assert_eq!(window[3][0], last_row as f64);
            assert_eq!(*label, labels[last_row], "window {} label must be its last row's", w);
        }
    }

    #[test]
    fn test_training_windows_reject_label_mismatch_and_short_series() {
        let series = raw_rows(&table(5));
        assert!(matches!(
            training_windows(&series, &[0, 1], 3),
            Err(ForecastError::TrainingDataShape { .. })
        ));
        assert!(matches!(
            training_windows(&series, &[0; 5], 6),
            Err(ForecastError::InsufficientHistory { required: 6, available: 5 })
        ));
    }

    #[test]
    fn test_last_window_is_the_trailing_slice() {
        let t = table(100);
        let window = last_window(&t, 72, &identity_scaler()).expect("enough history");
        assert_eq!(window.len(), 72);
        assert_eq!(window[0][0], 28.0);
        assert_eq!(window[71][0], 99.0);
    }

    #[test]
    fn test_last_window_applies_scaler() {
        let scaler = StandardScaler {
            mean: vec![1.0, 0.0, 1.0],
            scale: vec![2.0, 4.0, 1.0],
        };
        let window = last_window(&table(3), 1, &scaler).expect("enough history");
        assert_eq!(window, vec![[0.5, 1.0, 0.0]]);
    }

    #[test]
    fn test_last_window_needs_sequence_length_readings() {
        let err = last_window(&table(71), 72, &identity_scaler()).unwrap_err();
        assert_eq!(
            err,
            ForecastError::InsufficientHistory {
                required: 72,
                available: 71
            }
        );
    }
}
