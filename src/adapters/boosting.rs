//! Histogram gradient-boosted decision trees for binary classification.
//!
//! Trees are grown depth-first on pre-binned feature values with the
//! second-order logistic objective: a split's gain is
//! `G_L²/(H_L+λ) + G_R²/(H_R+λ) - G²/(H+λ)` and a leaf's weight is
//! `-G/(H+λ)` shrunk by the learning rate. Each tree is fitted to the
//! gradients left by the trees before it.

use serde::{Deserialize, Serialize};

use super::recurrent::sigmoid;
use crate::model::ForecastError;

/// Hyperparameters of the boosted model, read from `[tabular]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BoostingParams {
    pub n_trees: usize,
    pub max_depth: usize,
    pub learning_rate: f64,
    /// Rounds without validation improvement before stopping.
    pub early_stopping_rounds: usize,
    pub lambda: f64,
    pub min_child_weight: f64,
    pub max_bins: usize,
}

impl Default for BoostingParams {
    fn default() -> Self {
        Self {
            n_trees: 100,
            max_depth: 5,
            learning_rate: 0.3,
            early_stopping_rounds: 10,
            lambda: 1.0,
            min_child_weight: 1.0,
            max_bins: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BoostingReport {
    pub rounds_trained: usize,
    pub trees_kept: usize,
    pub best_iteration: Option<usize>,
    pub best_validation_loss: Option<f64>,
}

// ---------------------------------------------------------------------------
// Trees
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        weight: f64,
    },
    /// Rows with `x[feature] <= threshold` go left.
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

/// A tree stored as a flat node list rooted at index 0.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegressionTree {
    pub nodes: Vec<TreeNode>,
}

impl RegressionTree {
    pub fn predict(&self, row: &[f64]) -> f64 {
        let mut index = 0;
        loop {
            match self.nodes.get(index) {
                Some(TreeNode::Leaf { weight }) => return *weight,
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    index = if row[*feature] <= *threshold { *left } else { *right };
                }
                None => return 0.0,
            }
        }
    }

    /// Children always follow their parent, so traversal terminates.
    fn is_consistent(&self, n_features: usize) -> bool {
        !self.nodes.is_empty()
            && self.nodes.iter().enumerate().all(|(i, node)| match node {
                TreeNode::Leaf { weight } => weight.is_finite(),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    *feature < n_features
                        && threshold.is_finite()
                        && *left > i
                        && *right > i
                        && *left < self.nodes.len()
                        && *right < self.nodes.len()
                }
            })
    }
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradientBoostedClassifier {
    pub n_features: usize,
    /// Initial margin, the log-odds of the training flood rate.
    pub base_score: f64,
    pub trees: Vec<RegressionTree>,
}

impl GradientBoostedClassifier {
    /// Fits on `rows` with 0/1 `labels`. With a non-empty `validation` set
    /// the ensemble stops once validation log-loss fails to improve for
    /// `early_stopping_rounds` rounds and is cut back to its best round.
    pub fn fit<R: AsRef<[f64]>>(
        rows: &[R],
        labels: &[u8],
        validation: Option<(&[R], &[u8])>,
        params: &BoostingParams,
    ) -> Result<(Self, BoostingReport), ForecastError> {
        let n_features = check_matrix(rows, labels, None)?;
        let validation = match validation {
            Some((v_rows, v_labels)) if !v_rows.is_empty() => {
                check_matrix(v_rows, v_labels, Some(n_features))?;
                Some((v_rows, v_labels))
            }
            _ => None,
        };

        let targets: Vec<f64> = labels.iter().map(|&l| f64::from(l.min(1))).collect();
        let positive_rate = targets.iter().sum::<f64>() / targets.len() as f64;
        let clamped = positive_rate.clamp(1e-6, 1.0 - 1e-6);
        let base_score = (clamped / (1.0 - clamped)).ln();

        let binned = BinnedMatrix::build(rows, n_features, params.max_bins);
        let builder = TreeBuilder {
            binned: &binned,
            max_depth: params.max_depth,
            lambda: params.lambda.max(0.0),
            min_child_weight: params.min_child_weight.max(0.0),
            learning_rate: params.learning_rate,
        };

        let mut model = Self {
            n_features,
            base_score,
            trees: Vec::with_capacity(params.n_trees),
        };
        let mut margins = vec![base_score; rows.len()];
        let mut gradients = vec![0.0; rows.len()];
        let mut hessians = vec![0.0; rows.len()];

        let mut validation_margins = validation.map(|(v_rows, _)| vec![base_score; v_rows.len()]);
        let mut best: Option<(usize, f64)> = None;

        for round in 0..params.n_trees {
            for i in 0..rows.len() {
                let p = sigmoid(margins[i]);
                gradients[i] = p - targets[i];
                hessians[i] = (p * (1.0 - p)).max(1e-16);
            }

            let tree = builder.grow(&gradients, &hessians);
            for (margin, row) in margins.iter_mut().zip(rows) {
                *margin += tree.predict(row.as_ref());
            }

            if let (Some((v_rows, v_labels)), Some(v_margins)) =
                (validation, validation_margins.as_mut())
            {
                for (margin, row) in v_margins.iter_mut().zip(v_rows) {
                    *margin += tree.predict(row.as_ref());
                }
                let loss = log_loss(v_margins, v_labels);
                model.trees.push(tree);

                match best {
                    Some((_, best_loss)) if loss >= best_loss => {}
                    _ => best = Some((round, loss)),
                }
                if let Some((best_round, _)) = best {
                    if round - best_round >= params.early_stopping_rounds.max(1) {
                        break;
                    }
                }
            } else {
                model.trees.push(tree);
            }
        }

        let rounds_trained = model.trees.len();
        if let Some((best_round, _)) = best {
            model.trees.truncate(best_round + 1);
        }

        let report = BoostingReport {
            rounds_trained,
            trees_kept: model.trees.len(),
            best_iteration: best.map(|(round, _)| round),
            best_validation_loss: best.map(|(_, loss)| loss),
        };
        Ok((model, report))
    }

    pub fn predict_logit(&self, row: &[f64]) -> Result<f64, ForecastError> {
        if row.len() != self.n_features {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("{} features", self.n_features),
                found: format!("{} features", row.len()),
            });
        }
        Ok(self.base_score + self.trees.iter().map(|t| t.predict(row)).sum::<f64>())
    }

    pub fn predict_probability(&self, row: &[f64]) -> Result<f64, ForecastError> {
        self.predict_logit(row).map(sigmoid)
    }

    /// Structural check for deserialised models.
    pub fn is_consistent(&self) -> bool {
        self.n_features > 0
            && self.base_score.is_finite()
            && self.trees.iter().all(|t| t.is_consistent(self.n_features))
    }
}

fn log_loss(margins: &[f64], labels: &[u8]) -> f64 {
    let total: f64 = margins
        .iter()
        .zip(labels)
        .map(|(&m, &y)| {
            let p = sigmoid(m).clamp(1e-15, 1.0 - 1e-15);
            if y > 0 { -p.ln() } else { -(1.0 - p).ln() }
        })
        .sum();
    total / margins.len().max(1) as f64
}

/// Returns the row width after checking the matrix is rectangular, finite
/// and labelled.
fn check_matrix<R: AsRef<[f64]>>(
    rows: &[R],
    labels: &[u8],
    width: Option<usize>,
) -> Result<usize, ForecastError> {
    let Some(first) = rows.first() else {
        return Err(ForecastError::TrainingDataShape {
            expected: "at least one row".to_string(),
            found: "0 rows".to_string(),
        });
    };
    if rows.len() != labels.len() {
        return Err(ForecastError::TrainingDataShape {
            expected: format!("{} labels", rows.len()),
            found: format!("{} labels", labels.len()),
        });
    }
    let width = width.unwrap_or(first.as_ref().len());
    for row in rows {
        let row = row.as_ref();
        if row.len() != width || row.iter().any(|x| !x.is_finite()) {
            return Err(ForecastError::TrainingDataShape {
                expected: format!("{} finite features", width),
                found: format!("{:?}", row),
            });
        }
    }
    Ok(width)
}

// ---------------------------------------------------------------------------
// Histogram binning
// ---------------------------------------------------------------------------

/// Column-major bin indices plus the cut values separating the bins.
///
/// Bin `b` of a feature holds values in `(cuts[b-1], cuts[b]]`.
struct BinnedMatrix {
    cuts: Vec<Vec<f64>>,
    bins: Vec<Vec<u16>>,
    rows: usize,
}

impl BinnedMatrix {
    fn build<R: AsRef<[f64]>>(rows: &[R], n_features: usize, max_bins: usize) -> Self {
        let max_bins = max_bins.clamp(2, u16::MAX as usize);
        let mut cuts = Vec::with_capacity(n_features);
        let mut bins = Vec::with_capacity(n_features);

        for feature in 0..n_features {
            let mut values: Vec<f64> = rows.iter().map(|r| r.as_ref()[feature]).collect();
            values.sort_by(f64::total_cmp);
            let feature_cuts = cut_points(&values, max_bins);

            let column = rows
                .iter()
                .map(|r| {
                    let x = r.as_ref()[feature];
                    feature_cuts.partition_point(|c| *c < x) as u16
                })
                .collect();
            cuts.push(feature_cuts);
            bins.push(column);
        }
        Self {
            cuts,
            bins,
            rows: rows.len(),
        }
    }
}

/// Cut values for one sorted column. Few distinct values get midpoints
/// between neighbours; many get quantiles.
fn cut_points(sorted: &[f64], max_bins: usize) -> Vec<f64> {
    let mut unique = sorted.to_vec();
    unique.dedup();
    if unique.len() <= 1 {
        return Vec::new();
    }
    if unique.len() <= max_bins {
        return unique.windows(2).map(|w| (w[0] + w[1]) / 2.0).collect();
    }

    let mut cuts: Vec<f64> = (1..max_bins)
        .map(|k| sorted[k * sorted.len() / max_bins])
        .collect();
    cuts.dedup();
    // The maximum as a cut would leave an always-empty right side.
    if cuts.last() == unique.last() {
        cuts.pop();
    }
    cuts
}

// ---------------------------------------------------------------------------
// Tree growth
// ---------------------------------------------------------------------------

struct TreeBuilder<'a> {
    binned: &'a BinnedMatrix,
    max_depth: usize,
    lambda: f64,
    min_child_weight: f64,
    learning_rate: f64,
}

struct SplitChoice {
    feature: usize,
    bin: usize,
    gain: f64,
}

impl TreeBuilder<'_> {
    fn grow(&self, gradients: &[f64], hessians: &[f64]) -> RegressionTree {
        let mut nodes = Vec::new();
        let rows: Vec<usize> = (0..self.binned.rows).collect();
        self.grow_node(&rows, 0, gradients, hessians, &mut nodes);
        RegressionTree { nodes }
    }

    fn grow_node(
        &self,
        rows: &[usize],
        depth: usize,
        gradients: &[f64],
        hessians: &[f64],
        nodes: &mut Vec<TreeNode>,
    ) -> usize {
        let g: f64 = rows.iter().map(|&i| gradients[i]).sum();
        let h: f64 = rows.iter().map(|&i| hessians[i]).sum();
        let index = nodes.len();
        nodes.push(TreeNode::Leaf {
            weight: -g / (h + self.lambda) * self.learning_rate,
        });

        if depth >= self.max_depth {
            return index;
        }
        let Some(split) = self.best_split(rows, g, h, gradients, hessians) else {
            return index;
        };

        let column = &self.binned.bins[split.feature];
        let (left_rows, right_rows): (Vec<usize>, Vec<usize>) = rows
            .iter()
            .copied()
            .partition(|&i| (column[i] as usize) <= split.bin);

        let left = self.grow_node(&left_rows, depth + 1, gradients, hessians, nodes);
        let right = self.grow_node(&right_rows, depth + 1, gradients, hessians, nodes);
        nodes[index] = TreeNode::Split {
            feature: split.feature,
            threshold: self.binned.cuts[split.feature][split.bin],
            left,
            right,
        };
        index
    }

    fn best_split(
        &self,
        rows: &[usize],
        g: f64,
        h: f64,
        gradients: &[f64],
        hessians: &[f64],
    ) -> Option<SplitChoice> {
        let parent_score = g * g / (h + self.lambda);
        let mut best: Option<SplitChoice> = None;

        for (feature, cuts) in self.binned.cuts.iter().enumerate() {
            if cuts.is_empty() {
                continue;
            }
            let column = &self.binned.bins[feature];
            let mut hist_g = vec![0.0; cuts.len() + 1];
            let mut hist_h = vec![0.0; cuts.len() + 1];
            for &i in rows {
                let b = column[i] as usize;
                hist_g[b] += gradients[i];
                hist_h[b] += hessians[i];
            }

            let (mut gl, mut hl) = (0.0, 0.0);
            for bin in 0..cuts.len() {
                gl += hist_g[bin];
                hl += hist_h[bin];
                let (gr, hr) = (g - gl, h - hl);
                if hl < self.min_child_weight || hr < self.min_child_weight {
                    continue;
                }
                let gain =
                    gl * gl / (hl + self.lambda) + gr * gr / (hr + self.lambda) - parent_score;
                if gain > 1e-12 && best.as_ref().is_none_or(|b| gain > b.gain) {
                    best = Some(SplitChoice { feature, bin, gain });
                }
            }
        }
        best
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Label is 1 exactly when the second feature exceeds 5.
    fn threshold_data(n: usize) -> (Vec<[f64; 2]>, Vec<u8>) {
        let rows: Vec<[f64; 2]> = (0..n)
            .map(|i| [(i % 7) as f64, (i % 11) as f64])
            .collect();
        let labels = rows.iter().map(|r| u8::from(r[1] > 5.0)).collect();
        (rows, labels)
    }

    #[test]
    fn test_learns_a_single_threshold() {
        let (rows, labels) = threshold_data(440);
        let (model, report) =
            GradientBoostedClassifier::fit(&rows, &labels, None, &BoostingParams::default())
                .expect("valid data");
        assert_eq!(report.rounds_trained, 100);
        assert_eq!(report.best_iteration, None);

        for (row, label) in rows.iter().zip(&labels) {
            let p = model.predict_probability(row).unwrap();
            assert_eq!(u8::from(p > 0.5), *label, "row {:?} gave {}", row, p);
        }
        // The root split must be on the informative feature at 5.5.
        match &model.trees[0].nodes[0] {
            TreeNode::Split {
                feature, threshold, ..
            } => {
                assert_eq!(*feature, 1);
                assert_eq!(*threshold, 5.5);
            }
            other => panic!("expected a root split, got {:?}", other),
        }
    }

    #[test]
    fn test_early_stopping_truncates_to_best_round() {
        let (rows, labels) = threshold_data(330);
        let (train_rows, val_rows) = rows.split_at(264);
        let (train_labels, val_labels) = labels.split_at(264);
        let params = BoostingParams {
            n_trees: 400,
            early_stopping_rounds: 5,
            ..BoostingParams::default()
        };
        let (model, report) = GradientBoostedClassifier::fit(
            train_rows,
            train_labels,
            Some((val_rows, val_labels)),
            &params,
        )
        .expect("valid data");

        let best = report.best_iteration.expect("validation was supplied");
        assert_eq!(model.trees.len(), best + 1);
        assert_eq!(report.trees_kept, best + 1);
        assert!(report.rounds_trained <= 400);
        assert!(report.rounds_trained >= report.trees_kept);
    }

    #[test]
    fn test_constant_labels_yield_leaf_only_trees() {
        let rows = vec![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        let params = BoostingParams {
            n_trees: 3,
            ..BoostingParams::default()
        };
        let (model, _) = GradientBoostedClassifier::fit(&rows, &[0, 0, 0], None, &params).unwrap();
        assert!(model.predict_probability(&[3.0, 4.0]).unwrap() < 0.01);
        assert!(model.is_consistent());
    }

    #[test]
    fn test_shape_errors() {
        let rows = vec![vec![1.0, 2.0], vec![1.0]];
        assert!(GradientBoostedClassifier::fit(&rows, &[0, 1], None, &BoostingParams::default()).is_err());

        let rows = vec![[1.0, 2.0]];
        assert!(GradientBoostedClassifier::fit(&rows, &[0, 1], None, &BoostingParams::default()).is_err());

        let (model, _) =
            GradientBoostedClassifier::fit(&rows, &[1], None, &BoostingParams::default()).unwrap();
        assert!(matches!(
            model.predict_probability(&[1.0]),
            Err(ForecastError::TrainingDataShape { .. })
        ));
    }

    #[test]
    fn test_quantile_cuts_are_bounded_by_max_bins() {
        let sorted: Vec<f64> = (0..10_000).map(|i| i as f64).collect();
        let cuts = cut_points(&sorted, 16);
        assert!(cuts.len() <= 15);
        assert!(cuts.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_corrupt_tree_is_inconsistent() {
        let model = GradientBoostedClassifier {
            n_features: 2,
            base_score: 0.0,
            trees: vec![RegressionTree {
                nodes: vec![TreeNode::Split {
                    feature: 0,
                    threshold: 1.0,
                    left: 0,
                    right: 1,
                }],
            }],
        };
        assert!(!model.is_consistent());
    }
}
