//! Process-wide service state.
//!
//! Built once at startup by [`ForecastContext::initialize`], which loads
//! (or trains) every model before the first request, then passed by
//! reference to whatever serves requests.

use crate::config::ForecastConfig;
use crate::logging::{self, Component};
use crate::model::{Alert, ForecastError, RawReading};
use crate::predictor::HybridPredictor;
use crate::risk::{PredictionEnvelope, RiskPredictor};
use crate::simulation::{ReadingFeed, SimulationDriver, SyntheticFeed};
use crate::training::{self, TrainingReport};

pub struct ForecastContext {
    config: ForecastConfig,
    predictor: HybridPredictor,
    risk: RiskPredictor,
    training_report: Option<TrainingReport>,
}

impl ForecastContext {
    /// Validates `config`, then loads or trains the hybrid pair and the
    /// universal model.
    ///
    /// Without a usable universal model the context still starts; full
    /// 13-field requests then answer with a not-trained failure.
    pub fn initialize(config: ForecastConfig) -> Result<Self, ForecastError> {
        config.validate()?;
        let (predictor, training_report) = training::load_or_train(&config)?;

        let mut risk = RiskPredictor::new(config.risk.tiers, config.ensemble.threshold);
        match training::load_or_train_universal(&config) {
            Ok(model) => risk = risk.with_universal(model)?,
            Err(err) => logging::warn(
                Component::Risk,
                Some("universal"),
                &format!("full-schema requests disabled: {}", err),
            ),
        }

        Ok(Self::from_parts(config, predictor, risk, training_report))
    }

    pub fn from_parts(
        config: ForecastConfig,
        predictor: HybridPredictor,
        risk: RiskPredictor,
        training_report: Option<TrainingReport>,
    ) -> Self {
        Self {
            config,
            predictor,
            risk,
            training_report,
        }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    pub fn predictor(&self) -> &HybridPredictor {
        &self.predictor
    }

    pub fn risk(&self) -> &RiskPredictor {
        &self.risk
    }

    /// Set only when initialisation had to train.
    pub fn training_report(&self) -> Option<&TrainingReport> {
        self.training_report.as_ref()
    }

    /// Runs a live synthetic simulation with the configured buffer and seed.
    pub fn simulate(&self, hours: usize) -> Result<Vec<Alert>, ForecastError> {
        let feed = match self.config.simulation.seed {
            Some(seed) => SyntheticFeed::seeded(seed),
            None => SyntheticFeed::from_entropy(),
        };
        let mut driver =
            SimulationDriver::new(&self.predictor, self.config.simulation.buffer_capacity, feed);
        driver.warm_up()?;
        driver.run(hours)
    }

    /// Runs a simulation over caller-supplied history and feed.
    pub fn simulate_with<F: ReadingFeed>(
        &self,
        history: &[RawReading],
        feed: F,
        hours: usize,
    ) -> Result<Vec<Alert>, ForecastError> {
        let mut driver = SimulationDriver::seeded(
            &self.predictor,
            self.config.simulation.buffer_capacity,
            history,
            feed,
        );
        driver.run(hours)
    }

    /// Answers an inference request; never fails, errors are in the envelope.
    pub fn predict(&self, fields: &[(&str, f64)]) -> PredictionEnvelope {
        self.risk.respond(fields)
    }
}
