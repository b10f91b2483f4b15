//! Core data types for the flood risk forecasting service.
//!
//! This module defines the shared domain model imported by all other modules:
//! raw sensor readings, the engineered feature schema, ensemble decisions,
//! alerts, the training stage machine labels and the crate-wide error type.
//! It contains no I/O and no model logic, only types and schema checks.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Window constants
// ---------------------------------------------------------------------------

/// Number of raw fields per reading (rainfall, discharge, water level).
pub const RAW_FIELD_COUNT: usize = 3;

/// Names of the raw fields, in the order used by sequence windows.
pub const RAW_FIELD_NAMES: [&str; RAW_FIELD_COUNT] = ["rainfall", "discharge", "water_level"];

/// Trailing window of the rainfall rolling sum, current row included.
pub const ROLLING_SUM_WINDOW: usize = 24;

/// Trailing window of the water level rolling mean, current row included.
pub const ROLLING_MEAN_WINDOW: usize = 6;

/// Offset of the water level first difference.
pub const DIFF_OFFSET: usize = 1;

/// Offset of the discharge lag.
pub const LAG_OFFSET: usize = 3;

/// Rows before a position that must exist for its feature vector to be
/// defined. Rows with less trailing history are dropped, never filled.
pub const MIN_TRAILING_HISTORY: usize = ROLLING_SUM_WINDOW - 1;

/// Length of the temporal model's input window, in hourly readings.
pub const DEFAULT_SEQUENCE_LENGTH: usize = 72;

// ---------------------------------------------------------------------------
// Reading types
// ---------------------------------------------------------------------------

/// One hourly observation from the sensor feed.
///
/// Readings carry no timestamp: position in a [`RawTable`] is the time axis.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RawReading {
    pub rainfall: f64,    // mm over the hour, >= 0
    pub discharge: f64,   // river discharge, >= 0
    pub water_level: f64, // stage
}

impl RawReading {
    pub fn new(rainfall: f64, discharge: f64, water_level: f64) -> Self {
        Self {
            rainfall,
            discharge,
            water_level,
        }
    }

    /// The three raw fields in [`RAW_FIELD_NAMES`] order.
    pub fn as_array(&self) -> [f64; RAW_FIELD_COUNT] {
        [self.rainfall, self.discharge, self.water_level]
    }

    /// Checks the data model invariants for a reading found at `position`.
    ///
    /// All fields must be finite; rainfall and discharge must be non-negative.
    pub fn validate(&self, position: usize) -> Result<(), ForecastError> {
        let checks = [
            ("rainfall", self.rainfall, true),
            ("discharge", self.discharge, true),
            ("water_level", self.water_level, false),
        ];
        for (field, value, non_negative) in checks {
            if !value.is_finite() || (non_negative && value < 0.0) {
                return Err(ForecastError::InvalidReading {
                    position,
                    field,
                    value,
                });
            }
        }
        Ok(())
    }
}

/// An ordered sequence of readings; insertion order is the time axis.
pub type RawTable = Vec<RawReading>;

// ---------------------------------------------------------------------------
// Engineered features
// ---------------------------------------------------------------------------

/// Number of engineered features per row.
pub const FEATURE_COUNT: usize = 7;

/// The engineered feature schema. Training and real-time paths both emit
/// vectors in exactly this order.
pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    "rainfall",
    "discharge",
    "water_level",
    "rainfall_24h_sum",
    "water_level_6h_avg",
    "water_level_diff_1h",
    "discharge_lag_3h",
];

/// Engineered feature vector for one table position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub rainfall: f64,
    pub discharge: f64,
    pub water_level: f64,
    pub rainfall_24h_sum: f64,
    pub water_level_6h_avg: f64,
    pub water_level_diff_1h: f64,
    pub discharge_lag_3h: f64,
}

impl FeatureVector {
    /// Values in [`FEATURE_NAMES`] order.
    pub fn to_array(&self) -> [f64; FEATURE_COUNT] {
        [
            self.rainfall,
            self.discharge,
            self.water_level,
            self.rainfall_24h_sum,
            self.water_level_6h_avg,
            self.water_level_diff_1h,
            self.discharge_lag_3h,
        ]
    }

    pub fn from_array(values: [f64; FEATURE_COUNT]) -> Self {
        let [
            rainfall,
            discharge,
            water_level,
            rainfall_24h_sum,
            water_level_6h_avg,
            water_level_diff_1h,
            discharge_lag_3h,
        ] = values;
        Self {
            rainfall,
            discharge,
            water_level,
            rainfall_24h_sum,
            water_level_6h_avg,
            water_level_diff_1h,
            discharge_lag_3h,
        }
    }

    /// Builds a vector from named fields, which must match
    /// [`FEATURE_NAMES`] exactly and in declared order.
    ///
    /// Unknown names are reported before missing ones; a complete set in
    /// the wrong order (or with duplicates) is a [`ForecastError::FeatureOrder`].
    pub fn from_named(fields: &[(&str, f64)]) -> Result<Self, ForecastError> {
        if let Some((name, _)) = fields.iter().find(|(n, _)| !FEATURE_NAMES.contains(n)) {
            return Err(ForecastError::UnknownFeature(name.to_string()));
        }
        if let Some(missing) = FEATURE_NAMES
            .iter()
            .find(|expected| !fields.iter().any(|(n, _)| n == *expected))
        {
            return Err(ForecastError::MissingFeature(missing.to_string()));
        }
        let in_order = fields.len() == FEATURE_COUNT
            && fields.iter().zip(FEATURE_NAMES).all(|((n, _), expected)| *n == expected);
        if !in_order {
            return Err(ForecastError::FeatureOrder {
                expected: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
                found: fields.iter().map(|(n, _)| n.to_string()).collect(),
            });
        }

        let mut values = [0.0; FEATURE_COUNT];
        for (slot, (_, value)) in values.iter_mut().zip(fields) {
            *slot = *value;
        }
        Ok(Self::from_array(values))
    }

    /// Named fields in declared order, the inverse of [`FeatureVector::from_named`].
    pub fn named(&self) -> Vec<(&'static str, f64)> {
        FEATURE_NAMES.into_iter().zip(self.to_array()).collect()
    }
}

/// A feature vector together with the table position it was derived from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineeredRow {
    pub position: usize,
    pub features: FeatureVector,
}

// ---------------------------------------------------------------------------
// Decision types
// ---------------------------------------------------------------------------

/// Output of one ensemble evaluation. Derived, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleDecision {
    pub probability_temporal: f64,
    pub probability_tabular: f64,
    pub probability_blended: f64,
    pub is_flood: bool,
}

/// One record of the alert feed produced by the simulation driver.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub hour: usize,
    pub probability: f64,
    pub is_flood: bool,
}

// ---------------------------------------------------------------------------
// Training stages
// ---------------------------------------------------------------------------

/// Stages of the training orchestrator, in the only order they may occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrainingStage {
    Untrained,
    GeneratingData,
    EngineeringFeatures,
    Splitting,
    TrainingTabular,
    TrainingTemporal,
    Trained,
    Persisted,
}

impl fmt::Display for TrainingStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TrainingStage::Untrained => "UNTRAINED",
            TrainingStage::GeneratingData => "GENERATING_DATA",
            TrainingStage::EngineeringFeatures => "ENGINEERING_FEATURES",
            TrainingStage::Splitting => "SPLITTING",
            TrainingStage::TrainingTabular => "TRAINING_TABULAR",
            TrainingStage::TrainingTemporal => "TRAINING_TEMPORAL",
            TrainingStage::Trained => "TRAINED",
            TrainingStage::Persisted => "PERSISTED",
        };
        write!(f, "{}", name)
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Errors that can arise anywhere in feature engineering, model training,
/// artifact handling or inference.
#[derive(Debug, Clone, PartialEq)]
pub enum ForecastError {
    /// Not enough buffered readings for a window or feature computation.
    InsufficientHistory { required: usize, available: usize },
    /// A required input field is absent.
    MissingFeature(String),
    /// An input field is not part of the declared schema.
    UnknownFeature(String),
    /// All fields are present but not in the declared order.
    FeatureOrder {
        expected: Vec<String>,
        found: Vec<String>,
    },
    /// A reading violates the data model (non-finite or negative).
    InvalidReading {
        position: usize,
        field: &'static str,
        value: f64,
    },
    /// A model was queried before training or loading succeeded.
    NotTrained(&'static str),
    /// Data entering a model call has the wrong shape.
    TrainingDataShape { expected: String, found: String },
    /// A persisted artifact is missing, unreadable or schema-incompatible.
    ArtifactLoad { path: String, reason: String },
    /// An artifact could not be written.
    ArtifactSave { path: String, reason: String },
    /// Configuration could not be read or failed validation.
    Config(String),
    /// The historical readings store could not be queried.
    Ingest(String),
    /// A replay feed ran out of readings.
    FeedExhausted { hour: usize },
    /// The training orchestrator failed during `stage`.
    Stage {
        stage: TrainingStage,
        source: Box<ForecastError>,
    },
}

impl fmt::Display for ForecastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForecastError::InsufficientHistory { required, available } => write!(
                f,
                "Insufficient history: {} readings required, {} available",
                required, available
            ),
            ForecastError::MissingFeature(name) => write!(f, "Missing parameter: '{}'", name),
            ForecastError::UnknownFeature(name) => write!(f, "Unknown parameter: '{}'", name),
            ForecastError::FeatureOrder { expected, found } => write!(
                f,
                "Feature order mismatch: expected [{}], found [{}]",
                expected.join(", "),
                found.join(", ")
            ),
            ForecastError::InvalidReading {
                position,
                field,
                value,
            } => write!(f, "Invalid reading at row {}: {} = {}", position, field, value),
            ForecastError::NotTrained(model) => {
                write!(f, "{} model is not trained or loaded", model)
            }
            ForecastError::TrainingDataShape { expected, found } => {
                write!(f, "Data shape mismatch: expected {}, found {}", expected, found)
            }
            ForecastError::ArtifactLoad { path, reason } => {
                write!(f, "Could not load artifact {}: {}", path, reason)
            }
            ForecastError::ArtifactSave { path, reason } => {
                write!(f, "Could not save artifact {}: {}", path, reason)
            }
            ForecastError::Config(msg) => write!(f, "Configuration error: {}", msg),
            ForecastError::Ingest(msg) => write!(f, "Ingest error: {}", msg),
            ForecastError::FeedExhausted { hour } => {
                write!(f, "Reading feed exhausted at hour {}", hour)
            }
            ForecastError::Stage { stage, source } => {
                write!(f, "Training failed during {}: {}", stage, source)
            }
        }
    }
}

impl std::error::Error for ForecastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ForecastError::Stage { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
