//! Training orchestrator.
//!
//! Drives one training run through its stages, strictly in order:
//!
//! ```text
//! UNTRAINED → GENERATING_DATA → ENGINEERING_FEATURES → SPLITTING
//!           → TRAINING_TABULAR → TRAINING_TEMPORAL → TRAINED → PERSISTED
//! ```
//!
//! A failure in any stage returns `ForecastError::Stage` naming that stage
//! and drops the orchestrator back to UNTRAINED. Nothing is written to the
//! artifact store until the whole run has succeeded.

use std::ops::Range;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;

use crate::adapters::boosting::{BoostingReport, GradientBoostedClassifier};
use crate::adapters::{TabularAdapter, TemporalAdapter, TemporalReport, ValidationTail};
use crate::artifacts::ArtifactStore;
use crate::config::{DataSource, ForecastConfig};
use crate::features::partition::{Halo, WorkerPool, engineer_distributed};
use crate::ingest::history;
use crate::logging::{self, Component};
use crate::model::{FeatureVector, ForecastError, TrainingStage};
use crate::predictor::HybridPredictor;
use crate::risk;
use crate::synthetic::{self, Dataset};

/// Test rows scored by the blended ensemble for the training report.
pub const MAX_EVALUATION_ROWS: usize = 2000;

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Blended-ensemble scores on the test split.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Evaluation {
    pub rows: usize,
    pub floods: usize,
    pub accuracy: f64,
    pub precision: f64,
    pub recall: f64,
}

impl Evaluation {
    pub fn from_outcomes(outcomes: &[(bool, bool)]) -> Self {
        let count = |predicted: bool, actual: bool| {
            outcomes.iter().filter(|&&o| o == (predicted, actual)).count()
        };
        let tp = count(true, true);
        let tn = count(false, false);
        let fp = count(true, false);
        let fn_ = count(false, true);
        let ratio = |num: usize, den: usize| if den == 0 { 0.0 } else { num as f64 / den as f64 };

        Self {
            rows: outcomes.len(),
            floods: tp + fn_,
            accuracy: ratio(tp + tn, outcomes.len()),
            precision: ratio(tp, tp + fp),
            recall: ratio(tp, tp + fn_),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingReport {
    pub raw_rows: usize,
    pub flood_rows: usize,
    pub engineered_rows: usize,
    pub train_rows: usize,
    pub test_rows: usize,
    pub tabular: BoostingReport,
    /// Raw-table rows the temporal model was trained on.
    pub temporal_sample: Range<usize>,
    pub temporal: TemporalReport,
    pub evaluation: Evaluation,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct TrainingOrchestrator {
    config: ForecastConfig,
    stage: TrainingStage,
}

impl TrainingOrchestrator {
    pub fn new(config: ForecastConfig) -> Self {
        Self {
            config,
            stage: TrainingStage::Untrained,
        }
    }

    pub fn stage(&self) -> TrainingStage {
        self.stage
    }

    /// Acquires a dataset from the configured source and trains on it.
    pub fn run(&mut self) -> Result<(HybridPredictor, TrainingReport), ForecastError> {
        self.stage = TrainingStage::Untrained;
        self.attempt(|o| {
            o.advance(TrainingStage::GeneratingData);
            let dataset = o.acquire()?;
            o.train_stages(dataset)
        })
    }

    /// Trains on a dataset supplied by the caller.
    pub fn train_on(
        &mut self,
        dataset: Dataset,
    ) -> Result<(HybridPredictor, TrainingReport), ForecastError> {
        self.stage = TrainingStage::Untrained;
        self.attempt(|o| {
            o.advance(TrainingStage::GeneratingData);
            o.train_stages(dataset)
        })
    }

    /// Saves a freshly trained predictor. Only valid straight after a
    /// successful run.
    pub fn persist(
        &mut self,
        predictor: &HybridPredictor,
        store: &ArtifactStore,
    ) -> Result<(), ForecastError> {
        self.attempt(|o| {
            if o.stage != TrainingStage::Trained {
                return Err(ForecastError::NotTrained("hybrid"));
            }
            store.save_hybrid(predictor)?;
            o.advance(TrainingStage::Persisted);
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    fn advance(&mut self, next: TrainingStage) {
        debug_assert!(next > self.stage, "stage {} cannot follow {}", next, self.stage);
        self.stage = next;
        logging::debug(Component::Training, Some(&next.to_string()), "entered stage");
    }

    /// Runs `step`; on failure tags the error with the current stage and
    /// resets to UNTRAINED.
    fn attempt<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, ForecastError>,
    ) -> Result<T, ForecastError> {
        step(self).map_err(|err| {
            let err = ForecastError::Stage {
                stage: self.stage,
                source: Box::new(err),
            };
            self.stage = TrainingStage::Untrained;
            logging::log_stage_failure(&err);
            err
        })
    }

    fn acquire(&self) -> Result<Dataset, ForecastError> {
        let training = &self.config.training;
        let readings = match training.source {
            DataSource::Synthetic => {
                let pool = WorkerPool::new(training.workers);
                synthetic::generate_partitioned(
                    training.n_hours,
                    training.partitions,
                    &pool,
                    training.seed,
                )
            }
            DataSource::Database => {
                let url = training.database_url.as_deref().ok_or_else(|| {
                    ForecastError::Config("DATABASE_URL is not set".to_string())
                })?;
                let mut client = history::connect(url)?;
                history::load_readings(&mut client, &training.station_id, training.n_hours)?
            }
        };
        logging::info(
            Component::Training,
            None,
            &format!("acquired {} raw readings ({:?})", readings.len(), training.source),
        );
        Ok(Dataset::labelled(readings, training.label_rule))
    }

    fn train_stages(
        &mut self,
        dataset: Dataset,
    ) -> Result<(HybridPredictor, TrainingReport), ForecastError> {
        let config = self.config.clone();
        let training = &config.training;
        if dataset.labels.len() != dataset.readings.len() {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("{} labels", dataset.readings.len()),
                found: format!("{} labels", dataset.labels.len()),
            });
        }

        // Engineered rows keep their raw position, which is how labels join.
        self.advance(TrainingStage::EngineeringFeatures);
        let pool = WorkerPool::new(training.workers);
        let rows = engineer_distributed(&dataset.readings, training.partitions, Halo::Carry, &pool)?;
        let features: Vec<FeatureVector> = rows.iter().map(|r| r.features).collect();
        let labels: Vec<u8> = rows.iter().map(|r| dataset.labels[r.position]).collect();

        self.advance(TrainingStage::Splitting);
        let split = (training.train_fraction * rows.len() as f64).floor() as usize;
        if split == 0 || split >= rows.len() {
            return Err(ForecastError::TrainingDataShape {
                expected: "engineered rows on both sides of the split".to_string(),
                found: format!("{} rows split at {}", rows.len(), split),
            });
        }
        logging::log_training_summary(dataset.len(), rows.len(), split, rows.len() - split);

        self.advance(TrainingStage::TrainingTabular);
        let mut tabular = TabularAdapter::new(config.tabular.clone());
        let tabular_report = tabular.train(
            &features[..split],
            &labels[..split],
            Some(ValidationTail {
                features: &features[split..],
                labels: &labels[split..],
            }),
        )?;
        logging::info(
            Component::Model,
            Some("tabular"),
            &format!(
                "{} trees kept of {} trained",
                tabular_report.trees_kept, tabular_report.rounds_trained
            ),
        );

        self.advance(TrainingStage::TrainingTemporal);
        let sequence_length = config.model.sequence_length;
        let mut rng = StdRng::seed_from_u64(training.seed);
        let block = temporal_block(
            dataset.len(),
            training.temporal_sample_fraction,
            sequence_length + 1,
            &mut rng,
        );
        let mut temporal = TemporalAdapter::new(sequence_length, config.temporal.clone());
        let temporal_report = temporal.fit_table(
            &dataset.readings[block.clone()],
            &dataset.labels[block.clone()],
        )?;
        logging::info(
            Component::Model,
            Some("temporal"),
            &format!(
                "{} windows from rows {}..{}, best loss {:.5} at epoch {}",
                temporal_report.windows,
                block.start,
                block.end,
                temporal_report.best_loss,
                temporal_report.best_epoch
            ),
        );

        let predictor = HybridPredictor::new(temporal, tabular, config.ensemble);
        let evaluation = evaluate(&predictor, &dataset, &rows[split..])?;
        self.advance(TrainingStage::Trained);
        logging::info(
            Component::Training,
            None,
            &format!(
                "test accuracy {:.3}, precision {:.3}, recall {:.3} over {} rows",
                evaluation.accuracy, evaluation.precision, evaluation.recall, evaluation.rows
            ),
        );

        let report = TrainingReport {
            raw_rows: dataset.len(),
            flood_rows: dataset.flood_count(),
            engineered_rows: rows.len(),
            train_rows: split,
            test_rows: rows.len() - split,
            tabular: tabular_report,
            temporal_sample: block,
            temporal: temporal_report,
            evaluation,
        };
        Ok((predictor, report))
    }
}

/// A random contiguous block of `ceil(fraction · n)` rows, widened to at
/// least `min_len` and never longer than `n`.
pub fn temporal_block<R: Rng>(n: usize, fraction: f64, min_len: usize, rng: &mut R) -> Range<usize> {
    let len = ((fraction * n as f64).ceil() as usize).max(min_len).min(n);
    let start = rng.random_range(0..=n - len);
    start..start + len
}

/// Scores up to [`MAX_EVALUATION_ROWS`] test rows whose raw history is long
/// enough for a full temporal window.
fn evaluate(
    predictor: &HybridPredictor,
    dataset: &Dataset,
    test_rows: &[crate::model::EngineeredRow],
) -> Result<Evaluation, ForecastError> {
    let sequence_length = predictor.temporal.sequence_length();
    let outcomes = test_rows
        .iter()
        .filter(|row| row.position + 1 >= sequence_length)
        .take(MAX_EVALUATION_ROWS)
        .map(|row| {
            let p_temporal = predictor
                .temporal
                .predict_table(&dataset.readings[..=row.position])?;
            let p_tabular = predictor.tabular.predict_probability(&row.features)?;
            let decision = predictor.ensemble.evaluate(p_temporal, p_tabular);
            Ok((decision.is_flood, dataset.labels[row.position] == 1))
        })
        .collect::<Result<Vec<_>, ForecastError>>()?;
    Ok(Evaluation::from_outcomes(&outcomes))
}

// ---------------------------------------------------------------------------
// Load-or-train
// ---------------------------------------------------------------------------

/// Loads the hybrid pair from the artifact store. If that fails for any
/// reason, trains once from scratch and persists the result.
pub fn load_or_train(
    config: &ForecastConfig,
) -> Result<(HybridPredictor, Option<TrainingReport>), ForecastError> {
    let store = ArtifactStore::new(&config.model.artifact_dir, &config.model.family);
    match store.load_hybrid(&config.load_settings()) {
        Ok(predictor) => Ok((predictor, None)),
        Err(err) => {
            logging::log_load_failure(&config.model.family, &err);
            let (predictor, report) = train_and_persist(config, &store)?;
            Ok((predictor, Some(report)))
        }
    }
}

/// Trains unconditionally and persists.
pub fn train_and_persist(
    config: &ForecastConfig,
    store: &ArtifactStore,
) -> Result<(HybridPredictor, TrainingReport), ForecastError> {
    let mut orchestrator = TrainingOrchestrator::new(config.clone());
    let (predictor, report) = orchestrator.run()?;
    orchestrator.persist(&predictor, store)?;
    Ok((predictor, report))
}

/// Loads the universal 13-field model, training and saving it if absent or
/// unreadable.
pub fn load_or_train_universal(
    config: &ForecastConfig,
) -> Result<GradientBoostedClassifier, ForecastError> {
    let store = ArtifactStore::new(&config.model.artifact_dir, &config.model.family);
    match store.load_universal() {
        Ok(model) => Ok(model),
        Err(err) => {
            logging::log_load_failure("universal", &err);
            train_universal(config, &store)
        }
    }
}

/// Trains the universal model on synthetic rows and saves it.
pub fn train_universal(
    config: &ForecastConfig,
    store: &ArtifactStore,
) -> Result<GradientBoostedClassifier, ForecastError> {
    let training = &config.training;
    let (model, report) = risk::train_universal(
        training.universal_rows,
        training.seed,
        training.label_rule,
        &config.tabular,
    )?;
    logging::info(
        Component::Model,
        Some("universal"),
        &format!("{} trees kept of {} trained", report.trees_kept, report.rounds_trained),
    );
    store.save_universal(&model)?;
    Ok(model)
}
