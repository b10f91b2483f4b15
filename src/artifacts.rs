//! On-disk model artifacts.
//!
//! Layout under `<artifact_dir>/<family>/`:
//!
//! ```text
//! temporal_weights.json   recurrent network + sequence length
//! temporal_scaler.json    scaler over the 3 raw fields
//! tabular_model.json      boosted trees over the 7 engineered features
//! tabular_scaler.json     scaler over the 7 engineered features
//! universal_model.json    boosted trees over the 13-field request schema
//! ```
//!
//! Every file is a JSON envelope carrying a format version, its kind and
//! the field schema it was trained on. The four hybrid files also share a
//! run id. They are all staged as `.tmp` files before any is renamed into
//! place, and loading rejects a set whose run ids differ. Loading the
//! hybrid pair is all-or-nothing: a missing, corrupt or mismatched file
//! fails the whole load and nothing is installed.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::adapters::boosting::{BoostingParams, GradientBoostedClassifier};
use crate::adapters::recurrent::RecurrentNetwork;
use crate::adapters::{TabularAdapter, TemporalAdapter, TemporalParams};
use crate::ensemble::EnsembleConfig;
use crate::logging::{self, Component};
use crate::model::{FEATURE_NAMES, ForecastError, RAW_FIELD_NAMES};
use crate::predictor::HybridPredictor;
use crate::risk::FULL_FIELDS;
use crate::scaler::StandardScaler;

pub const FORMAT_VERSION: u32 = 1;

pub const TEMPORAL_WEIGHTS_FILE: &str = "temporal_weights.json";
pub const TEMPORAL_SCALER_FILE: &str = "temporal_scaler.json";
pub const TABULAR_MODEL_FILE: &str = "tabular_model.json";
pub const TABULAR_SCALER_FILE: &str = "tabular_scaler.json";
pub const UNIVERSAL_MODEL_FILE: &str = "universal_model.json";

/// Reason recorded when an artifact file does not exist.
pub const NOT_FOUND: &str = "not found";

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    kind: String,
    schema: Vec<String>,
    /// Shared by every file written in one `save_hybrid` call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    payload: T,
}

/// A serialized artifact waiting under its `.tmp` name.
struct Staged {
    tmp: PathBuf,
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct TemporalWeights {
    sequence_length: usize,
    network: RecurrentNetwork,
}

/// Settings the loaded adapters are rebuilt with. Only the fitted state
/// comes from disk.
#[derive(Debug, Clone)]
pub struct LoadSettings {
    pub sequence_length: usize,
    pub temporal: TemporalParams,
    pub tabular: BoostingParams,
    pub ensemble: EnsembleConfig,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// A store for the model family `family` under `artifact_dir`.
    pub fn new(artifact_dir: impl AsRef<Path>, family: &str) -> Self {
        Self {
            root: artifact_dir.as_ref().join(family),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, file: &str) -> PathBuf {
        self.root.join(file)
    }

    // -----------------------------------------------------------------------
    // Hybrid pair
    // -----------------------------------------------------------------------

    /// Writes both adapters' fitted state. Fails with `NotTrained` before
    /// touching the disk if either adapter is untrained.
    ///
    /// All four files are staged before the first rename, so a failed
    /// write leaves the previous set untouched.
    pub fn save_hybrid(&self, predictor: &HybridPredictor) -> Result<(), ForecastError> {
        let (network, temporal_scaler) = predictor.temporal.parts()?;
        let (model, tabular_scaler) = predictor.tabular.parts()?;

        self.ensure_root()?;
        let run_id = new_run_id();
        let weights = TemporalWeights {
            sequence_length: predictor.temporal.sequence_length(),
            network: network.clone(),
        };

        let mut staged = Vec::with_capacity(4);
        let result = (|| -> Result<(), ForecastError> {
            staged.push(self.stage(
                TEMPORAL_WEIGHTS_FILE,
                "temporal_weights",
                &RAW_FIELD_NAMES,
                Some(&run_id),
                &weights,
            )?);
            staged.push(self.stage(
                TEMPORAL_SCALER_FILE,
                "temporal_scaler",
                &RAW_FIELD_NAMES,
                Some(&run_id),
                temporal_scaler,
            )?);
            staged.push(self.stage(
                TABULAR_MODEL_FILE,
                "tabular_model",
                &FEATURE_NAMES,
                Some(&run_id),
                model,
            )?);
            staged.push(self.stage(
                TABULAR_SCALER_FILE,
                "tabular_scaler",
                &FEATURE_NAMES,
                Some(&run_id),
                tabular_scaler,
            )?);
            Ok(())
        })();

        if let Err(err) = result {
            for file in &staged {
                let _ = fs::remove_file(&file.tmp);
            }
            return Err(err);
        }
        for file in &staged {
            commit(file)?;
        }

        logging::info(
            Component::Artifacts,
            Some(&self.root.display().to_string()),
            &format!("saved temporal and tabular artifacts (run {})", run_id),
        );
        Ok(())
    }

    /// Loads both adapters or neither.
    pub fn load_hybrid(&self, settings: &LoadSettings) -> Result<HybridPredictor, ForecastError> {
        let weights: Envelope<TemporalWeights> =
            self.read(TEMPORAL_WEIGHTS_FILE, "temporal_weights", &RAW_FIELD_NAMES)?;
        let temporal_scaler: Envelope<StandardScaler> =
            self.read(TEMPORAL_SCALER_FILE, "temporal_scaler", &RAW_FIELD_NAMES)?;
        let model: Envelope<GradientBoostedClassifier> =
            self.read(TABULAR_MODEL_FILE, "tabular_model", &FEATURE_NAMES)?;
        let tabular_scaler: Envelope<StandardScaler> =
            self.read(TABULAR_SCALER_FILE, "tabular_scaler", &FEATURE_NAMES)?;

        let run_id = &weights.run_id;
        for (file, other) in [
            (TEMPORAL_SCALER_FILE, &temporal_scaler.run_id),
            (TABULAR_MODEL_FILE, &model.run_id),
            (TABULAR_SCALER_FILE, &tabular_scaler.run_id),
        ] {
            if run_id.is_none() || other != run_id {
                return Err(self.load_error(
                    file,
                    format!(
                        "run {} does not match {} run {}",
                        other.as_deref().unwrap_or("<none>"),
                        TEMPORAL_WEIGHTS_FILE,
                        run_id.as_deref().unwrap_or("<none>")
                    ),
                ));
            }
        }
        let (weights, temporal_scaler) = (weights.payload, temporal_scaler.payload);
        let (model, tabular_scaler) = (model.payload, tabular_scaler.payload);

        if weights.sequence_length != settings.sequence_length {
            return Err(self.load_error(
                TEMPORAL_WEIGHTS_FILE,
                format!(
                    "sequence length {} does not match configured {}",
                    weights.sequence_length, settings.sequence_length
                ),
            ));
        }

        let mut temporal = TemporalAdapter::new(settings.sequence_length, settings.temporal.clone());
        temporal
            .restore(weights.network, temporal_scaler)
            .map_err(|err| self.load_error(TEMPORAL_WEIGHTS_FILE, err.to_string()))?;

        let mut tabular = TabularAdapter::new(settings.tabular.clone());
        tabular
            .restore(model, tabular_scaler)
            .map_err(|err| self.load_error(TABULAR_MODEL_FILE, err.to_string()))?;

        logging::info(
            Component::Artifacts,
            Some(&self.root.display().to_string()),
            "loaded temporal and tabular artifacts",
        );
        Ok(HybridPredictor::new(temporal, tabular, settings.ensemble))
    }

    // -----------------------------------------------------------------------
    // Universal model
    // -----------------------------------------------------------------------

    pub fn save_universal(&self, model: &GradientBoostedClassifier) -> Result<(), ForecastError> {
        self.ensure_root()?;
        let staged = self.stage(UNIVERSAL_MODEL_FILE, "universal_model", &FULL_FIELDS, None, model)?;
        commit(&staged)
    }

    pub fn load_universal(&self) -> Result<GradientBoostedClassifier, ForecastError> {
        let model: GradientBoostedClassifier = self
            .read::<GradientBoostedClassifier>(UNIVERSAL_MODEL_FILE, "universal_model", &FULL_FIELDS)?
            .payload;
        if model.n_features != FULL_FIELDS.len() || !model.is_consistent() {
            return Err(self.load_error(
                UNIVERSAL_MODEL_FILE,
                format!("expected a model over {} fields", FULL_FIELDS.len()),
            ));
        }
        Ok(model)
    }

    // -----------------------------------------------------------------------
    // File plumbing
    // -----------------------------------------------------------------------

    fn ensure_root(&self) -> Result<(), ForecastError> {
        fs::create_dir_all(&self.root).map_err(|e| ForecastError::ArtifactSave {
            path: self.root.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Serializes `payload` to `<file>.tmp`. [`commit`] renames it into
    /// place, so a crash never leaves a half-written artifact under the
    /// final name.
    fn stage<T: Serialize>(
        &self,
        file: &str,
        kind: &str,
        schema: &[&str],
        run_id: Option<&str>,
        payload: &T,
    ) -> Result<Staged, ForecastError> {
        let path = self.path(file);
        let save_error = |reason: String| ForecastError::ArtifactSave {
            path: path.display().to_string(),
            reason,
        };

        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            kind: kind.to_string(),
            schema: schema.iter().map(|s| s.to_string()).collect(),
            run_id: run_id.map(String::from),
            payload,
        };
        let json = serde_json::to_string(&envelope).map_err(|e| save_error(e.to_string()))?;

        let tmp = self.root.join(format!("{}.tmp", file));
        fs::write(&tmp, json).map_err(|e| save_error(e.to_string()))?;
        Ok(Staged { tmp, path })
    }

    fn read<T: DeserializeOwned>(
        &self,
        file: &str,
        kind: &str,
        schema: &[&str],
    ) -> Result<Envelope<T>, ForecastError> {
        let path = self.path(file);
        if !path.exists() {
            return Err(self.load_error(file, NOT_FOUND.to_string()));
        }
        let text = fs::read_to_string(&path).map_err(|e| self.load_error(file, e.to_string()))?;
        let envelope: Envelope<T> =
            serde_json::from_str(&text).map_err(|e| self.load_error(file, e.to_string()))?;

        if envelope.format_version != FORMAT_VERSION {
            return Err(self.load_error(
                file,
                format!(
                    "format version {} (expected {})",
                    envelope.format_version, FORMAT_VERSION
                ),
            ));
        }
        if envelope.kind != kind {
            return Err(self.load_error(
                file,
                format!("artifact kind '{}' (expected '{}')", envelope.kind, kind),
            ));
        }
        if envelope.schema.iter().map(String::as_str).ne(schema.iter().copied()) {
            return Err(self.load_error(
                file,
                format!("schema [{}] (expected [{}])", envelope.schema.join(", "), schema.join(", ")),
            ));
        }
        Ok(envelope)
    }

    fn load_error(&self, file: &str, reason: String) -> ForecastError {
        ForecastError::ArtifactLoad {
            path: self.path(file).display().to_string(),
            reason,
        }
    }
}

fn commit(staged: &Staged) -> Result<(), ForecastError> {
    fs::rename(&staged.tmp, &staged.path).map_err(|e| ForecastError::ArtifactSave {
        path: staged.path.display().to_string(),
        reason: e.to_string(),
    })
}

/// Timestamp plus a random suffix; unique per save.
fn new_run_id() -> String {
    format!(
        "{}-{:08x}",
        Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
        rand::random::<u32>()
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::engineer_features;
    use crate::logging::{FailureType, classify_load_failure};
    use crate::synthetic::{LabelRule, generate_readings, label_floods};

    const L: usize = 8;

    /// A small trained pair; different seeds give different fitted state.
    fn trained(seed: u64) -> HybridPredictor {
        let readings = generate_readings(300, seed);
        let labels = label_floods(&readings, LabelRule::Percentile95);

        let mut temporal = TemporalAdapter::new(
            L,
            TemporalParams {
                hidden_units: vec![3],
                epochs: 1,
                seed,
                ..TemporalParams::default()
            },
        );
        temporal.fit_table(&readings, &labels).expect("temporal trains");

        let rows = engineer_features(&readings).expect("valid readings");
        let features: Vec<_> = rows.iter().map(|r| r.features).collect();
        let row_labels: Vec<u8> = rows.iter().map(|r| labels[r.position]).collect();
        let mut tabular = TabularAdapter::new(BoostingParams {
            n_trees: 3,
            ..BoostingParams::default()
        });
        tabular.train(&features, &row_labels, None).expect("tabular trains");

        HybridPredictor::new(temporal, tabular, EnsembleConfig::default())
    }

    fn small_settings() -> LoadSettings {
        LoadSettings {
            sequence_length: L,
            ..settings()
        }
    }

    fn settings() -> LoadSettings {
        LoadSettings {
            sequence_length: 72,
            temporal: TemporalParams::default(),
            tabular: BoostingParams::default(),
            ensemble: EnsembleConfig::default(),
        }
    }

    #[test]
    fn test_missing_directory_is_an_expected_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        let err = store.load_hybrid(&settings()).unwrap_err();
        assert!(
            matches!(&err, ForecastError::ArtifactLoad { reason, .. } if reason == NOT_FOUND),
            "got {:?}",
            err
        );
        assert_eq!(classify_load_failure(&err), FailureType::Expected);
        assert!(store.load_universal().is_err());
    }

    #[test]
    fn test_untrained_predictor_is_not_saved() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        let predictor = HybridPredictor::new(
            TemporalAdapter::new(72, TemporalParams::default()),
            TabularAdapter::new(BoostingParams::default()),
            EnsembleConfig::default(),
        );
        assert_eq!(
            store.save_hybrid(&predictor),
            Err(ForecastError::NotTrained("temporal"))
        );
        assert!(!store.root().exists(), "nothing may be written for an untrained model");
    }

    #[test]
    fn test_envelope_kind_and_schema_are_checked() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        store.ensure_root().unwrap();

        let scaler = StandardScaler {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        };
        let staged = store
            .stage(TEMPORAL_SCALER_FILE, "temporal_scaler", &RAW_FIELD_NAMES, None, &scaler)
            .unwrap();
        commit(&staged).unwrap();
        let back: Envelope<StandardScaler> = store
            .read(TEMPORAL_SCALER_FILE, "temporal_scaler", &RAW_FIELD_NAMES)
            .unwrap();
        assert_eq!(back.payload, scaler);
        assert_eq!(back.run_id, None, "standalone files carry no run id");

        let wrong_kind: Result<Envelope<StandardScaler>, _> =
            store.read(TEMPORAL_SCALER_FILE, "tabular_scaler", &RAW_FIELD_NAMES);
        assert!(matches!(wrong_kind, Err(ForecastError::ArtifactLoad { .. })));

        let wrong_schema: Result<Envelope<StandardScaler>, _> =
            store.read(TEMPORAL_SCALER_FILE, "temporal_scaler", &FEATURE_NAMES);
        assert!(matches!(wrong_schema, Err(ForecastError::ArtifactLoad { .. })));
        assert!(!store.path("temporal_scaler.json.tmp").exists());
    }

    #[test]
    fn test_corrupt_file_is_an_unexpected_failure() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        store.ensure_root().unwrap();
        fs::write(store.path(UNIVERSAL_MODEL_FILE), "{ not json").unwrap();

        let err = store.load_universal().unwrap_err();
        assert_eq!(classify_load_failure(&err), FailureType::Unexpected);
    }

    #[test]
    fn test_failed_write_leaves_previous_set_intact() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        let run_a = trained(1);
        let run_b = trained(2);
        store.save_hybrid(&run_a).expect("first save");

        // The third staged file cannot be created.
        fs::create_dir(store.path("tabular_model.json.tmp")).unwrap();
        let err = store.save_hybrid(&run_b).unwrap_err();
        assert!(
            matches!(&err, ForecastError::ArtifactSave { path, .. } if path.ends_with(TABULAR_MODEL_FILE)),
            "got {:?}",
            err
        );
        assert!(!store.path("temporal_weights.json.tmp").exists(), "staged files are cleaned up");
        assert!(!store.path("temporal_scaler.json.tmp").exists(), "staged files are cleaned up");

        let loaded = store.load_hybrid(&small_settings()).expect("previous set still loads");
        let scaler_a = run_a.temporal.scaler().unwrap();
        let scaler_b = run_b.temporal.scaler().unwrap();
        assert_ne!(scaler_a, scaler_b, "runs must differ for this check to mean anything");
        assert_eq!(loaded.temporal.scaler().unwrap(), scaler_a);
        assert_eq!(loaded.tabular.parts().unwrap().1, run_a.tabular.parts().unwrap().1);

        let snapshot = generate_readings(60, 9);
        assert_eq!(loaded.evaluate(&snapshot), run_a.evaluate(&snapshot));
    }

    #[test]
    fn test_mixed_runs_are_rejected() {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = ArtifactStore::new(dir.path(), "hybrid");
        store.save_hybrid(&trained(1)).expect("first save");
        let old_scaler = fs::read_to_string(store.path(TABULAR_SCALER_FILE)).unwrap();

        store.save_hybrid(&trained(2)).expect("second save");
        assert!(store.load_hybrid(&small_settings()).is_ok());

        fs::write(store.path(TABULAR_SCALER_FILE), old_scaler).unwrap();
        match store.load_hybrid(&small_settings()) {
            Err(ForecastError::ArtifactLoad { path, reason }) => {
                assert!(path.ends_with(TABULAR_SCALER_FILE), "blamed {}", path);
                assert!(reason.contains("does not match"), "reason: {}", reason);
            }
            other => panic!("expected ArtifactLoad, got {:?}", other.map(|_| ())),
        }
    }
}
