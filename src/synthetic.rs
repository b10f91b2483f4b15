//! Seeded synthetic sensor history and flood labels.
//!
//! Generation law, per hour:
//!
//! - rainfall ~ U(0, 30), plus U(20, 50) during a storm hour
//! - discharge = 2 · rainfall + N(0, 1), clipped at 0
//! - water_level = 1.5 + 0.05 · discharge + N(0, 0.2), clipped at 0
//!
//! A table of `n` hours carries `n / 50` storm hours at random positions.
//! The same law drives the live [`crate::simulation::SyntheticFeed`].

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::features::partition::{WorkerPool, plan_partitions};
use crate::model::{RawReading, RawTable};

/// One storm hour per this many generated hours.
pub const STORM_SPACING: usize = 50;

/// How a flood label is derived from the water-level column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelRule {
    /// Water level above the 95th percentile of the table.
    #[default]
    Percentile95,
    /// Water level above mean + 2 standard deviations.
    MeanPlusTwoStd,
}

/// A raw table with one label per row.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub readings: RawTable,
    pub labels: Vec<u8>,
}

impl Dataset {
    pub fn labelled(readings: RawTable, rule: LabelRule) -> Self {
        let labels = label_floods(&readings, rule);
        Self { readings, labels }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn flood_count(&self) -> usize {
        self.labels.iter().filter(|&&l| l == 1).count()
    }
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

/// Draws one reading from the generation law.
pub fn sample_reading<R: Rng>(rng: &mut R, storm: bool) -> RawReading {
    let mut rainfall = rng.random_range(0.0..30.0);
    if storm {
        rainfall += rng.random_range(20.0..50.0);
    }
    let noise: f64 = rng.sample(StandardNormal);
    let discharge = (2.0 * rainfall + noise).max(0.0);
    let noise: f64 = rng.sample(StandardNormal);
    let water_level = (1.5 + 0.05 * discharge + 0.2 * noise).max(0.0);
    RawReading::new(rainfall, discharge, water_level)
}

/// `n` consecutive hours from a single RNG stream seeded with `seed`.
pub fn generate_readings(n: usize, seed: u64) -> RawTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut storm = vec![false; n];
    if n > 0 {
        for _ in 0..n / STORM_SPACING {
            storm[rng.random_range(0..n)] = true;
        }
    }
    storm.into_iter().map(|s| sample_reading(&mut rng, s)).collect()
}

/// `n` hours generated across `partitions` contiguous ranges on `pool`.
///
/// Partition `k` draws from its own stream seeded with `seed + k`, so the
/// table depends on the partition count but never on the worker count.
pub fn generate_partitioned(n: usize, partitions: usize, pool: &WorkerPool, seed: u64) -> RawTable {
    let plan = plan_partitions(n, partitions);
    pool.run(plan, |partition| {
        generate_readings(partition.len(), seed.wrapping_add(partition.index as u64))
    })
    .concat()
}

// ---------------------------------------------------------------------------
// Labels
// ---------------------------------------------------------------------------

/// Flood labels for every row of `readings` under `rule`.
pub fn label_floods(readings: &[RawReading], rule: LabelRule) -> Vec<u8> {
    let levels: Vec<f64> = readings.iter().map(|r| r.water_level).collect();
    let Some(threshold) = flood_threshold(&levels, rule) else {
        return Vec::new();
    };
    levels.iter().map(|&l| u8::from(l > threshold)).collect()
}

/// Water level a reading must strictly exceed to count as a flood.
pub fn flood_threshold(levels: &[f64], rule: LabelRule) -> Option<f64> {
    if levels.is_empty() {
        return None;
    }
    match rule {
        LabelRule::Percentile95 => {
            let mut sorted = levels.to_vec();
            sorted.sort_by(f64::total_cmp);
            Some(quantile(&sorted, 0.95))
        }
        LabelRule::MeanPlusTwoStd => {
            let n = levels.len() as f64;
            let mean = levels.iter().sum::<f64>() / n;
            let std = if levels.len() > 1 {
                let ss: f64 = levels.iter().map(|l| (l - mean) * (l - mean)).sum();
                (ss / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            Some(mean + 2.0 * std)
        }
    }
}

/// Linear-interpolated quantile of a sorted, non-empty slice.
fn quantile(sorted: &[f64], q: f64) -> f64 {
    let position = q * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;
    sorted[lower] + (sorted[upper] - sorted[lower]) * fraction
}
