//! Temporal model adapter: a stacked recurrent classifier over windows of
//! raw readings.
//!
//! The adapter owns the network and the scaler fitted on its training
//! rows. Both are `None` until `fit_table`/`train` succeeds or `restore`
//! installs persisted ones, and every query before that fails with
//! `NotTrained("temporal")`.

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use super::recurrent::{Adam, RecurrentNetwork};
use crate::logging::{self, Component};
use crate::model::{ForecastError, RAW_FIELD_COUNT, RawReading};
use crate::scaler::StandardScaler;
use crate::sequence::{self, SequenceRow};

const MODEL: &str = "temporal";

/// Hyperparameters of the recurrent model, read from `[temporal]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemporalParams {
    pub hidden_units: Vec<usize>,
    pub learning_rate: f64,
    pub epochs: usize,
    pub batch_size: usize,
    /// Epochs without training-loss improvement before stopping.
    pub patience: usize,
    /// Global gradient norm ceiling; 0 disables clipping.
    pub clip_norm: f64,
    pub seed: u64,
}

impl Default for TemporalParams {
    fn default() -> Self {
        Self {
            hidden_units: vec![32, 16],
            learning_rate: 0.001,
            epochs: 8,
            batch_size: 32,
            patience: 2,
            clip_norm: 5.0,
            seed: 7,
        }
    }
}

/// Outcome of one temporal training run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TemporalReport {
    pub windows: usize,
    pub epochs_run: usize,
    pub best_epoch: usize,
    pub best_loss: f64,
    pub loss_history: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct TemporalAdapter {
    sequence_length: usize,
    params: TemporalParams,
    trained: Option<(RecurrentNetwork, StandardScaler)>,
}

impl TemporalAdapter {
    pub fn new(sequence_length: usize, params: TemporalParams) -> Self {
        Self {
            sequence_length: sequence_length.max(1),
            params,
            trained: None,
        }
    }

    pub fn sequence_length(&self) -> usize {
        self.sequence_length
    }

    pub fn params(&self) -> &TemporalParams {
        &self.params
    }

    pub fn is_trained(&self) -> bool {
        self.trained.is_some()
    }

    /// Fits the scaler on `table`, builds every labelled window and trains.
    ///
    /// `labels[i]` belongs to `table[i]`; each window takes the label of its
    /// final row.
    pub fn fit_table(
        &mut self,
        table: &[RawReading],
        labels: &[u8],
    ) -> Result<TemporalReport, ForecastError> {
        crate::features::validate_table(table, 0)?;
        let series = sequence::raw_rows(table);
        let scaler = StandardScaler::fit(&series)?;
        let scaled = scaler.transform_all(&series)?;
        let (windows, aligned) =
            sequence::training_windows(&scaled, labels, self.sequence_length)?;
        self.train(scaler, &windows, &aligned)
    }

    /// Trains on pre-scaled `windows`, replacing any previous model.
    ///
    /// Mini-batches are drawn in a fresh shuffled order every epoch. Training
    /// stops after `patience` epochs without a lower mean loss, and the
    /// lowest-loss weights are the ones kept.
    pub fn train(
        &mut self,
        scaler: StandardScaler,
        windows: &[&[SequenceRow]],
        labels: &[u8],
    ) -> Result<TemporalReport, ForecastError> {
        scaler.ensure_width(RAW_FIELD_COUNT)?;
        if windows.is_empty() || windows.len() != labels.len() {
            return Err(ForecastError::TrainingDataShape {
                expected: "one label per window, at least one window".to_string(),
                found: format!("{} windows / {} labels", windows.len(), labels.len()),
            });
        }
        if let Some(window) = windows.iter().find(|w| w.len() != self.sequence_length) {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("windows of ({}, {})", self.sequence_length, RAW_FIELD_COUNT),
                found: format!("window of ({}, {})", window.len(), RAW_FIELD_COUNT),
            });
        }

        let params = &self.params;
        let mut rng = StdRng::seed_from_u64(params.seed);
        let mut network = RecurrentNetwork::new(RAW_FIELD_COUNT, &params.hidden_units, &mut rng);
        let mut optimiser = Adam::new(&network, params.learning_rate);
        let batch_size = params.batch_size.max(1);
        let targets: Vec<f64> = labels.iter().map(|&l| f64::from(l.min(1))).collect();

        let mut order: Vec<usize> = (0..windows.len()).collect();
        let mut best = (network.clone(), f64::INFINITY, 0);
        let mut history = Vec::with_capacity(params.epochs);
        let mut stale_epochs = 0;

        for epoch in 1..=params.epochs.max(1) {
            order.shuffle(&mut rng);
            let mut total_loss = 0.0;

            for batch in order.chunks(batch_size) {
                let mut grads = network.zeros_like();
                for &i in batch {
                    total_loss += network.accumulate_gradients(windows[i], targets[i], &mut grads);
                }
                grads.scale(1.0 / batch.len() as f64);
                grads.clip_norm(params.clip_norm);
                optimiser.apply(&mut network, &grads);
            }

            let epoch_loss = total_loss / windows.len() as f64;
            history.push(epoch_loss);
            logging::debug(
                Component::Model,
                Some(MODEL),
                &format!("epoch {} loss {:.5}", epoch, epoch_loss),
            );

            if epoch_loss < best.1 {
                best = (network.clone(), epoch_loss, epoch);
                stale_epochs = 0;
            } else {
                stale_epochs += 1;
                if stale_epochs >= params.patience.max(1) {
                    logging::info(
                        Component::Model,
                        Some(MODEL),
                        &format!("early stop after epoch {} (best epoch {})", epoch, best.2),
                    );
                    break;
                }
            }
        }

        let (network, best_loss, best_epoch) = best;
        if !best_loss.is_finite() {
            return Err(ForecastError::TrainingDataShape {
                expected: "finite training loss".to_string(),
                found: format!("{}", best_loss),
            });
        }
        self.trained = Some((network, scaler));

        Ok(TemporalReport {
            windows: windows.len(),
            epochs_run: history.len(),
            best_epoch,
            best_loss,
            loss_history: history,
        })
    }

    /// The scaler fitted at training time.
    pub fn scaler(&self) -> Result<&StandardScaler, ForecastError> {
        self.trained
            .as_ref()
            .map(|(_, scaler)| scaler)
            .ok_or(ForecastError::NotTrained(MODEL))
    }

    /// Flood probability for one window already scaled by [`Self::scaler`].
    pub fn predict_probability(&self, window: &[SequenceRow]) -> Result<f64, ForecastError> {
        let (network, _) = self.trained.as_ref().ok_or(ForecastError::NotTrained(MODEL))?;
        self.check_window(window)?;
        Ok(network.predict(window))
    }

    /// Flood probability for the newest window of a raw `table`.
    pub fn predict_table(&self, table: &[RawReading]) -> Result<f64, ForecastError> {
        let window = sequence::last_window(table, self.sequence_length, self.scaler()?)?;
        self.predict_probability(&window)
    }

    /// Installs a persisted network and scaler after checking their shapes.
    pub fn restore(
        &mut self,
        network: RecurrentNetwork,
        scaler: StandardScaler,
    ) -> Result<(), ForecastError> {
        scaler.ensure_width(RAW_FIELD_COUNT)?;
        if !network.is_consistent(RAW_FIELD_COUNT) {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("recurrent network over {} inputs", RAW_FIELD_COUNT),
                found: format!("network over {} inputs", network.inputs()),
            });
        }
        self.trained = Some((network, scaler));
        Ok(())
    }

    pub fn parts(&self) -> Result<(&RecurrentNetwork, &StandardScaler), ForecastError> {
        self.trained
            .as_ref()
            .map(|(network, scaler)| (network, scaler))
            .ok_or(ForecastError::NotTrained(MODEL))
    }

    /// Inference-side length check: short windows are missing history.
    fn check_window(&self, window: &[SequenceRow]) -> Result<(), ForecastError> {
        if window.len() < self.sequence_length {
            return Err(ForecastError::InsufficientHistory {
                required: self.sequence_length,
                available: window.len(),
            });
        }
        if window.len() != self.sequence_length {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("window of {} steps", self.sequence_length),
                found: format!("window of {} steps", window.len()),
            });
        }
        Ok(())
    }
}
