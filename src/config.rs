//! Service configuration.
//!
//! Read from a TOML file; every section and field has a default, so an
//! empty file (or no file at all) is a valid configuration. A few values
//! can be overridden from the environment, `.env` included:
//!
//! - `FLOMON_FORECAST_CONFIG` path of the TOML file
//! - `FLOMON_ARTIFACT_DIR` replaces `model.artifact_dir`
//! - `FLOMON_LOG_FILE` replaces `logging.file`
//! - `DATABASE_URL` connection string for `training.source = "database"`

use std::env;
use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::adapters::TemporalParams;
use crate::adapters::boosting::BoostingParams;
use crate::artifacts::LoadSettings;
use crate::ensemble::EnsembleConfig;
use crate::logging::LogLevel;
use crate::model::{DEFAULT_SEQUENCE_LENGTH, ForecastError, ROLLING_SUM_WINDOW};
use crate::risk::RiskTiers;
use crate::synthetic::LabelRule;

pub const CONFIG_PATH_VAR: &str = "FLOMON_FORECAST_CONFIG";
pub const ARTIFACT_DIR_VAR: &str = "FLOMON_ARTIFACT_DIR";
pub const LOG_FILE_VAR: &str = "FLOMON_LOG_FILE";
pub const DATABASE_URL_VAR: &str = "DATABASE_URL";

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub artifact_dir: String,
    /// Subdirectory of `artifact_dir` holding this model family's files.
    pub family: String,
    pub sequence_length: usize,
}

impl Default for ModelSection {
    fn default() -> Self {
        Self {
            artifact_dir: "models".to_string(),
            family: "hybrid".to_string(),
            sequence_length: DEFAULT_SEQUENCE_LENGTH,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataSource {
    #[default]
    Synthetic,
    Database,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrainingSection {
    pub source: DataSource,
    pub n_hours: usize,
    pub partitions: usize,
    pub workers: usize,
    pub train_fraction: f64,
    /// Share of the raw table, as one contiguous block, used for the
    /// temporal model.
    pub temporal_sample_fraction: f64,
    pub label_rule: LabelRule,
    pub seed: u64,
    /// Station read from `sensor_readings` when `source = "database"`.
    pub station_id: String,
    /// Rows of the 13-field universal training set.
    pub universal_rows: usize,
    /// From `DATABASE_URL`, never from the file.
    #[serde(skip)]
    pub database_url: Option<String>,
}

impl Default for TrainingSection {
    fn default() -> Self {
        Self {
            source: DataSource::Synthetic,
            n_hours: 200_000,
            partitions: 10,
            workers: 4,
            train_fraction: 0.8,
            temporal_sample_fraction: 0.05,
            label_rule: LabelRule::Percentile95,
            seed: 42,
            station_id: "default".to_string(),
            universal_rows: 20_000,
            database_url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SimulationSection {
    pub hours: usize,
    pub buffer_capacity: usize,
    /// Fixed feed seed; unset draws fresh entropy every run.
    pub seed: Option<u64>,
}

impl Default for SimulationSection {
    fn default() -> Self {
        Self {
            hours: 30,
            buffer_capacity: 100,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct RiskSection {
    pub tiers: RiskTiers,
}

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    pub level: LogLevel,
    pub file: Option<String>,
    pub timestamps: bool,
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub model: ModelSection,
    pub ensemble: EnsembleConfig,
    pub training: TrainingSection,
    pub tabular: BoostingParams,
    pub temporal: TemporalParams,
    pub simulation: SimulationSection,
    pub risk: RiskSection,
    pub logging: LoggingSection,
}

impl ForecastConfig {
    pub fn parse(text: &str) -> Result<Self, ForecastError> {
        toml::from_str(text).map_err(|e| ForecastError::Config(e.to_string()))
    }

    /// Reads and parses a TOML file. Does not validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ForecastError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .map_err(|e| ForecastError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&text)
    }

    /// Loads `.env`, then the file named by `FLOMON_FORECAST_CONFIG` (or
    /// the defaults when unset), then applies environment overrides.
    pub fn from_env() -> Result<Self, ForecastError> {
        dotenv::dotenv().ok();
        let mut config = match env::var(CONFIG_PATH_VAR) {
            Ok(path) => Self::load(path)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Copies the override variables that are set into the config.
    pub fn apply_env(&mut self) {
        if let Ok(dir) = env::var(ARTIFACT_DIR_VAR) {
            self.model.artifact_dir = dir;
        }
        if let Ok(file) = env::var(LOG_FILE_VAR) {
            self.logging.file = Some(file);
        }
        if let Ok(url) = env::var(DATABASE_URL_VAR) {
            self.training.database_url = Some(url);
        }
    }

    pub fn validate(&self) -> Result<(), ForecastError> {
        self.ensemble.validate()?;
        self.risk.tiers.validate()?;

        let training = &self.training;
        if !(training.train_fraction > 0.0 && training.train_fraction < 1.0) {
            return Err(ForecastError::Config(format!(
                "training.train_fraction must lie in (0, 1), got {}",
                training.train_fraction
            )));
        }
        if !(training.temporal_sample_fraction > 0.0 && training.temporal_sample_fraction <= 1.0) {
            return Err(ForecastError::Config(format!(
                "training.temporal_sample_fraction must lie in (0, 1], got {}",
                training.temporal_sample_fraction
            )));
        }
        if training.partitions == 0 || training.workers == 0 {
            return Err(ForecastError::Config(
                "training.partitions and training.workers must be at least 1".to_string(),
            ));
        }
        if training.source == DataSource::Database && training.database_url.is_none() {
            return Err(ForecastError::Config(format!(
                "training.source = \"database\" needs {}",
                DATABASE_URL_VAR
            )));
        }
        if self.model.sequence_length == 0 {
            return Err(ForecastError::Config(
                "model.sequence_length must be at least 1".to_string(),
            ));
        }
        let required = self.model.sequence_length + ROLLING_SUM_WINDOW;
        if self.simulation.buffer_capacity < required {
            return Err(ForecastError::Config(format!(
                "simulation.buffer_capacity {} is below sequence_length + {} = {}",
                self.simulation.buffer_capacity, ROLLING_SUM_WINDOW, required
            )));
        }
        Ok(())
    }

    /// What the artifact store needs to rebuild adapters from disk.
    pub fn load_settings(&self) -> LoadSettings {
        LoadSettings {
            sequence_length: self.model.sequence_length,
            temporal: self.temporal.clone(),
            tabular: self.tabular.clone(),
            ensemble: self.ensemble,
        }
    }
}
