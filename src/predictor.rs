//! Both adapters and the blend, evaluated together over one history
//! snapshot.

use crate::adapters::{TabularAdapter, TemporalAdapter};
use crate::ensemble::EnsembleConfig;
use crate::features;
use crate::model::{EnsembleDecision, ForecastError, RawReading};

#[derive(Debug, Clone)]
pub struct HybridPredictor {
    pub temporal: TemporalAdapter,
    pub tabular: TabularAdapter,
    pub ensemble: EnsembleConfig,
}

impl HybridPredictor {
    pub fn new(temporal: TemporalAdapter, tabular: TabularAdapter, ensemble: EnsembleConfig) -> Self {
        Self {
            temporal,
            tabular,
            ensemble,
        }
    }

    pub fn is_trained(&self) -> bool {
        self.temporal.is_trained() && self.tabular.is_trained()
    }

    /// Minimum snapshot length `evaluate` accepts.
    pub fn required_history(&self) -> usize {
        self.temporal
            .sequence_length()
            .max(crate::model::ROLLING_SUM_WINDOW)
    }

    /// Scores the newest reading of `snapshot`: the trailing window goes to
    /// the temporal model, the latest engineered vector to the tabular one.
    pub fn evaluate(&self, snapshot: &[RawReading]) -> Result<EnsembleDecision, ForecastError> {
        let p_temporal = self.temporal.predict_table(snapshot)?;
        let latest = features::latest_features(snapshot)?;
        let p_tabular = self.tabular.predict_probability(&latest)?;
        Ok(self.ensemble.evaluate(p_temporal, p_tabular))
    }
}
