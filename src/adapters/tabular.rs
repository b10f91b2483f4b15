//! Tabular model adapter: boosted trees over the seven engineered features.

use super::boosting::{BoostingParams, BoostingReport, GradientBoostedClassifier};
use crate::model::{FEATURE_COUNT, FeatureVector, ForecastError};
use crate::scaler::StandardScaler;

const MODEL: &str = "tabular";

/// Held-out rows used for early stopping. Always the rows that follow the
/// training rows in time; the orchestrator passes its test split.
#[derive(Debug, Clone, Copy)]
pub struct ValidationTail<'a> {
    pub features: &'a [FeatureVector],
    pub labels: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct TabularAdapter {
    params: BoostingParams,
    trained: Option<(GradientBoostedClassifier, StandardScaler)>,
}

impl TabularAdapter {
    pub fn new(params: BoostingParams) -> Self {
        Self {
            params,
            trained: None,
        }
    }

    pub fn params(&self) -> &BoostingParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Fits the feature scaler on `features` and trains the trees,
    /// replacing any previous model.
    pub fn train(
        &mut self,
        features: &[FeatureVector],
        labels: &[u8],
        validation: Option<ValidationTail<'_>>,
    ) -> Result<BoostingReport, ForecastError> {
        let rows: Vec<[f64; FEATURE_COUNT]> = features.iter().map(FeatureVector::to_array).collect();
        let scaler = StandardScaler::fit(&rows)?;
        let scaled = scaler.transform_all(&rows)?;

        let scaled_validation = validation
            .map(|tail| {
                let rows: Vec<[f64; FEATURE_COUNT]> =
                    tail.features.iter().map(FeatureVector::to_array).collect();
                scaler.transform_all(&rows).map(|scaled| (scaled, tail.labels))
            })
            .transpose()?;

        let (model, report) = GradientBoostedClassifier::fit(
            &scaled,
            labels,
            scaled_validation
                .as_ref()
                .map(|(rows, labels)| (rows.as_slice(), *labels)),
            &self.params,
        )?;
        self.trained = Some((model, scaler));
        Ok(report)
    }

    /// Flood probability for one engineered feature vector.
    pub fn predict_probability(&self, features: &FeatureVector) -> Result<f64, ForecastError> {
        let (model, scaler) = self.trained.as_ref().ok_or(ForecastError::NotTrained(MODEL))?;
        let scaled = scaler.transform(&features.to_array())?;
        model.predict_probability(&scaled)
    }

    /// Like [`Self::predict_probability`], for callers holding named fields.
    /// The names must match the feature schema exactly and in order.
    pub fn predict_named(&self, fields: &[(&str, f64)]) -> Result<f64, ForecastError> {
        if !self.is_trained() {
            return Err(ForecastError::NotTrained(MODEL));
        }
        self.predict_probability(&FeatureVector::from_named(fields)?)
    }

    pub fn restore(
        &mut self,
        model: GradientBoostedClassifier,
        scaler: StandardScaler,
    ) -> Result<(), ForecastError> {
        scaler.ensure_width(FEATURE_COUNT)?;
        if model.n_features != FEATURE_COUNT || !model.is_consistent() {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("boosted model over {} features", FEATURE_COUNT),
                found: format!("model over {} features", model.n_features),
            });
        }
        self.trained = Some((model, scaler));
        Ok(())
    }

    pub fn parts(&self) -> Result<(&GradientBoostedClassifier, &StandardScaler), ForecastError> {
        self.trained
            .as_ref()
            .map(|(model, scaler)| (model, scaler))
            .ok_or(ForecastError::NotTrained(MODEL))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FEATURE_NAMES;

    fn vector(level: f64) -> FeatureVector {
        FeatureVector::from_array([1.0, 2.0, level, 24.0, level, 0.0, 2.0])
    }

    fn trained() -> TabularAdapter {
        let features: Vec<FeatureVector> = (0..200).map(|i| vector((i % 20) as f64)).collect();
        let labels: Vec<u8> = features.iter().map(|f| u8::from(f.water_level > 15.0)).collect();
        let mut adapter = TabularAdapter::new(BoostingParams {
            n_trees: 20,
            ..BoostingParams::default()
        });
        adapter.train(&features, &labels, None).expect("valid data");
        adapter
    }

    #[test]
    fn test_untrained_adapter_refuses_queries() {
        let adapter = TabularAdapter::new(BoostingParams::default());
        assert_eq!(
            adapter.predict_probability(&vector(1.0)),
            Err(ForecastError::NotTrained("tabular"))
        );
        assert_eq!(adapter.predict_named(&[]), Err(ForecastError::NotTrained("tabular")));
    }

    #[test]
    fn test_trained_adapter_ranks_high_levels_above_low() {
        let adapter = trained();
        let high = adapter.predict_probability(&vector(19.0)).unwrap();
        let low = adapter.predict_probability(&vector(3.0)).unwrap();
        assert!(high > 0.5 && low < 0.5, "high {} low {}", high, low);
    }

    #[test]
    fn test_named_prediction_checks_schema() {
        let adapter = trained();
        let named = vector(19.0).named();
        assert_eq!(
            adapter.predict_named(&named).unwrap(),
            adapter.predict_probability(&vector(19.0)).unwrap()
        );

        let missing: Vec<(&str, f64)> = named[..6].to_vec();
        assert_eq!(
            adapter.predict_named(&missing),
            Err(ForecastError::MissingFeature(FEATURE_NAMES[6].to_string()))
        );

        let mut extra = named.clone();
        extra.push(("snowfall", 1.0));
        assert_eq!(
            adapter.predict_named(&extra),
            Err(ForecastError::UnknownFeature("snowfall".to_string()))
        );

        let mut reordered = named.clone();
        reordered.swap(0, 1);
        assert!(matches!(
            adapter.predict_named(&reordered),
            Err(ForecastError::FeatureOrder { .. })
        ));
    }

    #[test]
    fn test_validation_tail_enables_early_stopping() {
        let features: Vec<FeatureVector> = (0..300).map(|i| vector((i % 20) as f64)).collect();
        let labels: Vec<u8> = features.iter().map(|f| u8::from(f.water_level > 15.0)).collect();
        let (train, tail) = features.split_at(240);
        let (train_labels, tail_labels) = labels.split_at(240);

        let mut adapter = TabularAdapter::new(BoostingParams::default());
        let report = adapter
            .train(
                train,
                train_labels,
                Some(ValidationTail {
                    features: tail,
                    labels: tail_labels,
                }),
            )
            .expect("valid data");
        assert!(report.best_iteration.is_some());
        assert_eq!(adapter.parts().unwrap().0.trees.len(), report.trees_kept);
    }
}
