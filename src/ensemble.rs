//! Fixed-weight blending of the two model probabilities.
//!
//! Pure functions; the weights and threshold come from `[ensemble]` in the
//! configuration and default to an even blend decided at 0.5.

use serde::{Deserialize, Serialize};

use crate::model::{EnsembleDecision, ForecastError};

/// Weighted average of the temporal and tabular probabilities, clamped to
/// `[0, 1]`.
pub fn blend(p_temporal: f64, p_tabular: f64, weight_temporal: f64, weight_tabular: f64) -> f64 {
    (weight_temporal * p_temporal + weight_tabular * p_tabular).clamp(0.0, 1.0)
}

/// A flood is declared only when `probability` strictly exceeds `threshold`.
pub fn decide(probability: f64, threshold: f64) -> bool {
    probability > threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    pub weight_temporal: f64,
    pub weight_tabular: f64,
    pub threshold: f64,
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            weight_temporal: 0.5,
            weight_tabular: 0.5,
            threshold: 0.5,
        }
    }
}

impl EnsembleConfig {
    pub fn validate(&self) -> Result<(), ForecastError> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.weight_temporal) || !unit.contains(&self.weight_tabular) {
            return Err(ForecastError::Config(format!(
                "ensemble weights must lie in [0, 1], got {} and {}",
                self.weight_temporal, self.weight_tabular
            )));
        }
        if (self.weight_temporal + self.weight_tabular - 1.0).abs() > 1e-9 {
            return Err(ForecastError::Config(format!(
                "ensemble weights must sum to 1, got {}",
                self.weight_temporal + self.weight_tabular
            )));
        }
        if !unit.contains(&self.threshold) {
            return Err(ForecastError::Config(format!(
                "ensemble threshold must lie in [0, 1], got {}",
                self.threshold
            )));
        }
        Ok(())
    }

    pub fn blend(&self, p_temporal: f64, p_tabular: f64) -> f64 {
        blend(p_temporal, p_tabular, self.weight_temporal, self.weight_tabular)
    }

    pub fn decide(&self, probability: f64) -> bool {
        decide(probability, self.threshold)
    }

    /// Blends both probabilities and applies the threshold.
    pub fn evaluate(&self, p_temporal: f64, p_tabular: f64) -> EnsembleDecision {
        let blended = self.blend(p_temporal, p_tabular);
        EnsembleDecision {
            probability_temporal: p_temporal,
            probability_tabular: p_tabular,
            probability_blended: blended,
            is_flood: self.decide(blended),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blend_stays_within_unit_interval() {
        let grid: Vec<f64> = (0..=10).map(|i| i as f64 / 10.0).collect();
        for &pt in &grid {
            for &pb in &grid {
                for &wt in &grid {
                    let p = blend(pt, pb, wt, 1.0 - wt);
                    assert!((0.0..=1.0).contains(&p), "blend({}, {}, {}) = {}", pt, pb, wt, p);
                }
            }
        }
    }

    #[test]
    fn test_default_blend_is_the_mean() {
        let config = EnsembleConfig::default();
        assert!((config.blend(0.2, 0.6) - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_decide_is_strict() {
        assert!(!decide(0.5, 0.5), "probability equal to threshold is not a flood");
        assert!(decide(0.500001, 0.5));
        assert!(!decide(0.2, 0.5));
        assert!(decide(0.0001, 0.0));
        assert!(!decide(1.0, 1.0));
    }

    #[test]
    fn test_evaluate_carries_component_probabilities() {
        let decision = EnsembleConfig::default().evaluate(0.9, 0.3);
        assert_eq!(decision.probability_temporal, 0.9);
        assert_eq!(decision.probability_tabular, 0.3);
        assert!((decision.probability_blended - 0.6).abs() < 1e-12);
        assert!(decision.is_flood);
    }

    #[test]
    fn test_validate_rejects_bad_weights() {
        assert!(EnsembleConfig::default().validate().is_ok());
        let lopsided = EnsembleConfig {
            weight_temporal: 0.7,
            weight_tabular: 0.7,
            threshold: 0.5,
        };
        assert!(lopsided.validate().is_err());
        let negative = EnsembleConfig {
            weight_temporal: -0.5,
            weight_tabular: 1.5,
            threshold: 0.5,
        };
        assert!(negative.validate().is_err());
        let threshold = EnsembleConfig {
            threshold: 1.5,
            ..EnsembleConfig::default()
        };
        assert!(threshold.validate().is_err());
    }
}
