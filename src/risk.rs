//! Inference requests: named environmental fields in, risk assessment out.
//!
//! Two request schemas are accepted:
//!
//! - the simple 8-field schema, scored with a fixed weighted sum
//! - the full 13-field schema, scored by the universal boosted model
//!
//! A request belongs to the full schema as soon as it names any field only
//! that schema has. Fields outside the detected schema are rejected, and a
//! missing field is reported by name, the first one in declared order.

use chrono::Local;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::adapters::boosting::{BoostingParams, BoostingReport, GradientBoostedClassifier};
use crate::logging::{self, Component};
use crate::model::ForecastError;
use crate::synthetic::{self, LabelRule};

// ---------------------------------------------------------------------------
// Schemas
// ---------------------------------------------------------------------------

pub const SIMPLE_FIELDS: [&str; 8] = [
    "rainfall",
    "river_discharge",
    "water_level",
    "soil_moisture",
    "humidity",
    "wind_speed",
    "pressure",
    "deforestation_index",
];

pub const SIMPLE_WEIGHTS: [f64; 8] = [0.3, 0.2, 0.1, 0.1, 0.05, 0.05, 0.05, 0.15];

/// Weighted scores above these bound the "High" and "Moderate" bands.
pub const HIGH_SCORE: f64 = 150.0;
pub const MODERATE_SCORE: f64 = 80.0;

/// Field order the universal model was trained on.
pub const FULL_FIELDS: [&str; 13] = [
    "rainfall_mm",
    "river_discharge_cumec",
    "water_level_m",
    "soil_moisture_percent",
    "temperature_c",
    "humidity_percent",
    "wind_speed_ms",
    "pressure_hpa",
    "elevation_m",
    "population_density",
    "drainage_efficiency",
    "distance_to_coast_km",
    "deforestation_index",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestSchema {
    Simple,
    Full,
}

impl RequestSchema {
    /// Full as soon as any field belongs only to the full schema.
    pub fn detect(fields: &[(&str, f64)]) -> Self {
        let full_only = |name: &str| FULL_FIELDS.contains(&name) && !SIMPLE_FIELDS.contains(&name);
        if fields.iter().any(|&(name, _)| full_only(name)) {
            RequestSchema::Full
        } else {
            RequestSchema::Simple
        }
    }

    pub fn fields(&self) -> &'static [&'static str] {
        match self {
            RequestSchema::Simple => &SIMPLE_FIELDS,
            RequestSchema::Full => &FULL_FIELDS,
        }
    }
}

/// Values of `fields` in `schema` order.
pub fn ordered_values(
    schema: RequestSchema,
    fields: &[(&str, f64)],
) -> Result<Vec<f64>, ForecastError> {
    let names = schema.fields();
    if let Some((unknown, _)) = fields.iter().find(|(name, _)| !names.contains(name)) {
        return Err(ForecastError::UnknownFeature(unknown.to_string()));
    }

    names
        .iter()
        .enumerate()
        .map(|(position, &name)| {
            let (_, value) = fields
                .iter()
                .find(|(n, _)| *n == name)
                .ok_or_else(|| ForecastError::MissingFeature(name.to_string()))?;
            if !value.is_finite() {
                return Err(ForecastError::InvalidReading {
                    position,
                    field: name,
                    value: *value,
                });
            }
            Ok(*value)
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Risk tiers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    pub fn recommendation(&self) -> &'static str {
        match self {
            RiskLevel::Critical => "IMMEDIATE EVACUATION may be required! Contact authorities.",
            RiskLevel::High => {
                "Take immediate precautionary measures. Prepare for potential evacuation."
            }
            RiskLevel::Medium => "Monitor conditions closely. Prepare emergency supplies.",
            RiskLevel::Low => "Stay alert and monitor weather updates.",
            RiskLevel::Safe => "Current conditions appear normal.",
        }
    }
}

/// Lower probability bounds of the four upper tiers; anything below
/// `low` is SAFE.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskTiers {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

impl Default for RiskTiers {
    fn default() -> Self {
        Self {
            critical: 0.85,
            high: 0.65,
            medium: 0.45,
            low: 0.25,
        }
    }
}

impl RiskTiers {
    pub fn classify(&self, probability: f64) -> RiskLevel {
        if probability >= self.critical {
            RiskLevel::Critical
        } else if probability >= self.high {
            RiskLevel::High
        } else if probability >= self.medium {
            RiskLevel::Medium
        } else if probability >= self.low {
            RiskLevel::Low
        } else {
            RiskLevel::Safe
        }
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        let bounds = [self.critical, self.high, self.medium, self.low];
        let in_range = bounds.iter().all(|b| (0.0..=1.0).contains(b));
        let descending = bounds.windows(2).all(|w| w[0] > w[1]);
        if !in_range || !descending {
            return Err(ForecastError::Config(format!(
                "risk tiers must be strictly descending within [0, 1], got {:?}",
                bounds
            )));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Simple score
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScoreBand {
    #[serde(rename = "High Risk")]
    High,
    #[serde(rename = "Moderate Risk")]
    Moderate,
    #[serde(rename = "Low Risk")]
    Low,
}

/// Weighted sum of the eight simple fields, in [`SIMPLE_FIELDS`] order.
pub fn simple_score(values: &[f64]) -> f64 {
    values.iter().zip(SIMPLE_WEIGHTS).map(|(v, w)| v * w).sum()
}

pub fn score_band(score: f64) -> ScoreBand {
    if score > HIGH_SCORE {
        ScoreBand::High
    } else if score > MODERATE_SCORE {
        ScoreBand::Moderate
    } else {
        ScoreBand::Low
    }
}

/// Maps a score onto the probability scale so that the band edges land on
/// tier edges: `MODERATE_SCORE` maps to `tiers.medium` and `HIGH_SCORE` to
/// `tiers.high`, linearly, clamped to `[0, 1]`.
pub fn score_probability(score: f64, tiers: &RiskTiers) -> f64 {
    let slope = (tiers.high - tiers.medium) / (HIGH_SCORE - MODERATE_SCORE);
    (tiers.medium + (score - MODERATE_SCORE) * slope).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Responses
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskAssessment {
    pub prediction: String,
    pub probability: f64,
    pub risk_level: RiskLevel,
    pub recommendation: String,
    pub timestamp: String,
    pub schema: RequestSchema,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score_band: Option<ScoreBand>,
}

/// Structured response: failures become `{success: false, error}` instead
/// of propagating to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionEnvelope {
    pub success: bool,
    #[serde(flatten)]
    pub assessment: Option<RiskAssessment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<Result<RiskAssessment, ForecastError>> for PredictionEnvelope {
    fn from(result: Result<RiskAssessment, ForecastError>) -> Self {
        match result {
            Ok(assessment) => Self {
                success: true,
                assessment: Some(assessment),
                error: None,
            },
            Err(err) => Self {
                success: false,
                assessment: None,
                error: Some(err.to_string()),
            },
        }
    }
}

fn round3(p: f64) -> f64 {
    (p * 1000.0).round() / 1000.0
}

// ---------------------------------------------------------------------------
// Predictor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RiskPredictor {
    universal: Option<GradientBoostedClassifier>,
    tiers: RiskTiers,
    threshold: f64,
}

impl RiskPredictor {
    pub fn new(tiers: RiskTiers, threshold: f64) -> Self {
        Self {
            universal: None,
            tiers,
            threshold,
        }
    }

    pub fn with_universal(mut self, model: GradientBoostedClassifier) -> Result<Self, ForecastError> {
        if model.n_features != FULL_FIELDS.len() {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("{} features", FULL_FIELDS.len()),
                found: format!("{} features", model.n_features),
            });
        }
        self.universal = Some(model);
        Ok(self)
    }

    pub fn has_universal(&self) -> bool {
        self.universal.is_some()
    }

    pub fn tiers(&self) -> &RiskTiers {
        &self.tiers
    }

    pub fn predict(&self, fields: &[(&str, f64)]) -> Result<RiskAssessment, ForecastError> {
        let schema = RequestSchema::detect(fields);
        let values = ordered_values(schema, fields)?;

        let (probability, score_band) = match schema {
            RequestSchema::Simple => {
                let score = simple_score(&values);
                (score_probability(score, &self.tiers), Some(score_band(score)))
            }
            RequestSchema::Full => {
                let model = self
                    .universal
                    .as_ref()
                    .ok_or(ForecastError::NotTrained("universal"))?;
                (model.predict_probability(&values)?, None)
            }
        };

        let risk_level = self.tiers.classify(probability);
        let prediction = if probability > self.threshold {
            "FLOOD WARNING"
        } else {
            "NORMAL CONDITIONS"
        };

        Ok(RiskAssessment {
            prediction: prediction.to_string(),
            probability: round3(probability),
            risk_level,
            recommendation: risk_level.recommendation().to_string(),
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            schema,
            score_band,
        })
    }

    /// Like [`Self::predict`], folding any error into the envelope.
    pub fn respond(&self, fields: &[(&str, f64)]) -> PredictionEnvelope {
        let result = self.predict(fields);
        if let Err(err) = &result {
            logging::warn(Component::Risk, None, &format!("prediction rejected: {}", err));
        }
        PredictionEnvelope::from(result)
    }
}

// ---------------------------------------------------------------------------
// Universal model training
// ---------------------------------------------------------------------------

/// Synthetic 13-field rows: the hydrological fields follow the raw reading
/// generator, the site and weather covariates are drawn uniformly.
pub fn universal_dataset(n_rows: usize, seed: u64, rule: LabelRule) -> (Vec<[f64; 13]>, Vec<u8>) {
    let readings = synthetic::generate_readings(n_rows, seed);
    let labels = synthetic::label_floods(&readings, rule);
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(1));

    let rows = readings
        .iter()
        .map(|r| {
            [
                r.rainfall,
                r.discharge,
                r.water_level,
                rng.random_range(10.0..90.0),
                rng.random_range(5.0..40.0),
                rng.random_range(30.0..100.0),
                rng.random_range(0.0..25.0),
                rng.random_range(980.0..1040.0),
                rng.random_range(0.0..500.0),
                rng.random_range(10.0..5000.0),
                rng.random_range(0.0..1.0),
                rng.random_range(0.0..300.0),
                rng.random_range(0.0..1.0),
            ]
        })
        .collect();
    (rows, labels)
}

/// Trains the universal model, holding out the last tenth of the rows for
/// early stopping.
pub fn train_universal(
    n_rows: usize,
    seed: u64,
    rule: LabelRule,
    params: &BoostingParams,
) -> Result<(GradientBoostedClassifier, BoostingReport), ForecastError> {
    let (rows, labels) = universal_dataset(n_rows, seed, rule);
    let split = rows.len() - rows.len() / 10;
    let (train_rows, tail_rows) = rows.split_at(split);
    let (train_labels, tail_labels) = labels.split_at(split);
    GradientBoostedClassifier::fit(train_rows, train_labels, Some((tail_rows, tail_labels)), params)
}
