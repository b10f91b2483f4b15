//! Per-column standardisation fitted at training time and persisted with
//! each model.

use serde::{Deserialize, Serialize};

use crate::model::ForecastError;

/// Column means and scales; `transform` maps `x` to `(x - mean) / scale`.
///
/// Scales are population standard deviations. A constant column gets a
/// scale of 1 so it transforms to zero instead of dividing by zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl StandardScaler {
    /// Fits column statistics over `rows`. Every row must have the same
    /// width as the first.
    pub fn fit<R: AsRef<[f64]>>(rows: &[R]) -> Result<Self, ForecastError> {
        let Some(first) = rows.first() else {
            return Err(ForecastError::TrainingDataShape {
                expected: "at least one row".to_string(),
                found: "0 rows".to_string(),
            });
        };
        let width = first.as_ref().len();
        let n = rows.len() as f64;

        let mut mean = vec![0.0; width];
        for row in rows {
            let row = check_width(row.as_ref(), width)?;
            for (m, x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n);

        let mut variance = vec![0.0; width];
        for row in rows {
            for ((v, x), m) in variance.iter_mut().zip(row.as_ref()).zip(&mean) {
                *v += (x - m) * (x - m);
            }
        }
        let scale = variance
            .into_iter()
            .map(|v| {
                let std = (v / n).sqrt();
                if std > f64::EPSILON { std } else { 1.0 }
            })
            .collect();

        Ok(Self { mean, scale })
    }

    pub fn width(&self) -> usize {
        self.mean.len()
    }

    /// Fails unless this scaler was fitted on rows of `width` columns.
    pub fn ensure_width(&self, width: usize) -> Result<(), ForecastError> {
        if self.mean.len() != width || self.scale.len() != width {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("scaler over {} columns", width),
                found: format!("mean {} / scale {}", self.mean.len(), self.scale.len()),
            });
        }
        if self.scale.iter().any(|s| !s.is_finite() || *s <= 0.0) {
            return Err(ForecastError::TrainingDataShape {
                expected: "positive finite scales".to_string(),
                found: format!("{:?}", self.scale),
            });
        }
        Ok(())
    }

    pub fn transform<const N: usize>(&self, row: &[f64; N]) -> Result<[f64; N], ForecastError> {
        check_width(row, self.width())?;
        let mut out = [0.0; N];
        for (i, slot) in out.iter_mut().enumerate() {
            *slot = (row[i] - self.mean[i]) / self.scale[i];
        }
        Ok(out)
    }

    pub fn transform_all<const N: usize>(
        &self,
        rows: &[[f64; N]],
    ) -> Result<Vec<[f64; N]>, ForecastError> {
        rows.iter().map(|row| self.transform(row)).collect()
    }
}

fn check_width(row: &[f64], width: usize) -> Result<&[f64], ForecastError> {
    if row.len() != width {
        return Err(ForecastError::TrainingDataShape {
            expected: format!("{} columns", width),
            found: format!("{} columns", row.len()),
        });
    }
    Ok(row)
}
