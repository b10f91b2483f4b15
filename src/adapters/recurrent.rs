//! Stacked recurrent network with a sigmoid head, trained by truncation-free
//! backpropagation through time.
//!
//! Each layer is an Elman cell, `h_t = tanh(W x_t + U h_{t-1} + b)`. The
//! first layer reads the scaled window; each later layer reads the hidden
//! sequence of the one below. The head reads the top layer's final hidden
//! state and emits a flood probability.

use rand::Rng;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Dense matrix
// ---------------------------------------------------------------------------

/// Row-major `rows x cols` matrix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl Matrix {
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0.0; rows * cols],
        }
    }

    /// Glorot-uniform initialisation.
    pub fn glorot<R: Rng>(rows: usize, cols: usize, rng: &mut R) -> Self {
        let limit = (6.0 / (rows + cols) as f64).sqrt();
        let data = (0..rows * cols)
            .map(|_| rng.random_range(-limit..limit))
            .collect();
        Self { rows, cols, data }
    }

    /// `out += self * x`
    fn mul_add(&self, x: &[f64], out: &mut [f64]) {
        for (r, o) in out.iter_mut().enumerate() {
            let row = &self.data[r * self.cols..(r + 1) * self.cols];
            *o += row.iter().zip(x).map(|(w, v)| w * v).sum::<f64>();
        }
    }

    /// `out += self^T * v`
    fn transpose_mul_add(&self, v: &[f64], out: &mut [f64]) {
        for (r, vr) in v.iter().enumerate() {
            let row = &self.data[r * self.cols..(r + 1) * self.cols];
            for (o, w) in out.iter_mut().zip(row) {
                *o += w * vr;
            }
        }
    }

    /// `self += a (outer) b`
    fn add_outer(&mut self, a: &[f64], b: &[f64]) {
        for (r, ar) in a.iter().enumerate() {
            let row = &mut self.data[r * self.cols..(r + 1) * self.cols];
            for (w, bc) in row.iter_mut().zip(b) {
                *w += ar * bc;
            }
        }
    }

    fn is_shape(&self, rows: usize, cols: usize) -> bool {
        self.rows == rows && self.cols == cols && self.data.len() == rows * cols
    }
}

// ---------------------------------------------------------------------------
// Recurrent layer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentLayer {
    pub input: Matrix,     // units x inputs
    pub recurrent: Matrix, // units x units
    pub bias: Vec<f64>,
}

impl RecurrentLayer {
    pub fn new<R: Rng>(inputs: usize, units: usize, rng: &mut R) -> Self {
        Self {
            input: Matrix::glorot(units, inputs, rng),
            recurrent: Matrix::glorot(units, units, rng),
            bias: vec![0.0; units],
        }
    }

    fn zeros_like(&self) -> Self {
        Self {
            input: Matrix::zeros(self.input.rows, self.input.cols),
            recurrent: Matrix::zeros(self.recurrent.rows, self.recurrent.cols),
            bias: vec![0.0; self.bias.len()],
        }
    }

    pub fn units(&self) -> usize {
        self.bias.len()
    }

    pub fn inputs(&self) -> usize {
        self.input.cols
    }

    /// Hidden state after every step of `xs`.
    fn forward(&self, xs: &[Vec<f64>]) -> Vec<Vec<f64>> {
        let units = self.units();
        let mut states: Vec<Vec<f64>> = Vec::with_capacity(xs.len());
        for x in xs {
            let mut z = self.bias.clone();
            self.input.mul_add(x, &mut z);
            if let Some(previous) = states.last() {
                self.recurrent.mul_add(previous, &mut z);
            }
            debug_assert_eq!(z.len(), units);
            states.push(z.into_iter().map(f64::tanh).collect());
        }
        states
    }

    /// Backpropagates `dh_out` (loss gradient w.r.t. each emitted hidden
    /// state, excluding the recurrent path) through the sequence.
    ///
    /// Accumulates parameter gradients into `grads` and returns the
    /// gradient w.r.t. each input step.
    fn backward(
        &self,
        xs: &[Vec<f64>],
        hs: &[Vec<f64>],
        dh_out: &[Vec<f64>],
        grads: &mut RecurrentLayer,
    ) -> Vec<Vec<f64>> {
        let units = self.units();
        let mut dxs = vec![vec![0.0; self.inputs()]; xs.len()];
        let mut dh_next = vec![0.0; units];

        for t in (0..xs.len()).rev() {
            let dz: Vec<f64> = (0..units)
                .map(|j| (dh_out[t][j] + dh_next[j]) * (1.0 - hs[t][j] * hs[t][j]))
                .collect();

            grads.input.add_outer(&dz, &xs[t]);
            if t > 0 {
                grads.recurrent.add_outer(&dz, &hs[t - 1]);
            }
            for (b, d) in grads.bias.iter_mut().zip(&dz) {
                *b += d;
            }

            self.input.transpose_mul_add(&dz, &mut dxs[t]);
            dh_next.iter_mut().for_each(|v| *v = 0.0);
            self.recurrent.transpose_mul_add(&dz, &mut dh_next);
        }
        dxs
    }
}

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurrentNetwork {
    pub layers: Vec<RecurrentLayer>,
    pub head: Vec<f64>,
    pub head_bias: f64,
}

impl RecurrentNetwork {
    /// Builds a stack over `inputs` features with one layer per entry of
    /// `hidden_units`. An empty `hidden_units` gets a single 16-unit layer.
    pub fn new<R: Rng>(inputs: usize, hidden_units: &[usize], rng: &mut R) -> Self {
        let sizes: Vec<usize> = if hidden_units.is_empty() {
            vec![16]
        } else {
            hidden_units.iter().map(|&u| u.max(1)).collect()
        };

        let mut layers = Vec::with_capacity(sizes.len());
        let mut width = inputs;
        for &units in &sizes {
            layers.push(RecurrentLayer::new(width, units, rng));
            width = units;
        }
        let head = Matrix::glorot(1, width, rng).data;

        Self {
            layers,
            head,
            head_bias: 0.0,
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            layers: self.layers.iter().map(RecurrentLayer::zeros_like).collect(),
            head: vec![0.0; self.head.len()],
            head_bias: 0.0,
        }
    }

    pub fn inputs(&self) -> usize {
        self.layers.first().map(RecurrentLayer::inputs).unwrap_or(0)
    }

    /// Checks that every layer feeds the next and the head matches the top.
    pub fn is_consistent(&self, inputs: usize) -> bool {
        let mut width = inputs;
        for layer in &self.layers {
            let units = layer.units();
            if units == 0
                || !layer.input.is_shape(units, width)
                || !layer.recurrent.is_shape(units, units)
            {
                return false;
            }
            width = units;
        }
        !self.layers.is_empty()
            && self.head.len() == width
            && self.all_parameters().all(f64::is_finite)
    }

    fn all_parameters(&self) -> impl Iterator<Item = f64> + '_ {
        self.slices().into_iter().flat_map(|s| s.iter().copied())
    }

    fn hidden_sequences(&self, window: &[[f64; 3]]) -> Vec<Vec<Vec<f64>>> {
        let mut inputs: Vec<Vec<f64>> = window.iter().map(|row| row.to_vec()).collect();
        let mut outputs = Vec::with_capacity(self.layers.len() + 1);
        for layer in &self.layers {
            let hs = layer.forward(&inputs);
            outputs.push(std::mem::replace(&mut inputs, hs));
        }
        outputs.push(inputs);
        // outputs[0] is the window, outputs[l + 1] is layer l's hidden sequence.
        outputs
    }

    fn logit(&self, top: &[f64]) -> f64 {
        self.head.iter().zip(top).map(|(w, h)| w * h).sum::<f64>() + self.head_bias
    }

    /// Flood probability for one scaled window.
    pub fn predict(&self, window: &[[f64; 3]]) -> f64 {
        let sequences = self.hidden_sequences(window);
        let top = sequences
            .last()
            .and_then(|hs| hs.last())
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        sigmoid(self.logit(top))
    }

    /// Adds the gradient of the binary cross-entropy for one labelled
    /// window into `grads` and returns the loss.
    pub fn accumulate_gradients(
        &self,
        window: &[[f64; 3]],
        label: f64,
        grads: &mut RecurrentNetwork,
    ) -> f64 {
        let sequences = self.hidden_sequences(window);
        let steps = window.len();
        let Some(top) = sequences.last().and_then(|hs| hs.last()) else {
            return 0.0;
        };

        let p = sigmoid(self.logit(top));
        let loss = binary_cross_entropy(p, label);
        let d_logit = p - label;

        for (g, h) in grads.head.iter_mut().zip(top) {
            *g += d_logit * h;
        }
        grads.head_bias += d_logit;

        let top_units = self.head.len();
        let mut dh_out = vec![vec![0.0; top_units]; steps];
        for (d, w) in dh_out[steps - 1].iter_mut().zip(&self.head) {
            *d = d_logit * w;
        }

        for (l, layer) in self.layers.iter().enumerate().rev() {
            dh_out = layer.backward(&sequences[l], &sequences[l + 1], &dh_out, &mut grads.layers[l]);
        }
        loss
    }

    /// Parameter slices in a fixed order shared with [`Self::slices_mut`].
    pub fn slices(&self) -> Vec<&[f64]> {
        let mut out: Vec<&[f64]> = Vec::with_capacity(self.layers.len() * 3 + 2);
        for layer in &self.layers {
            out.push(&layer.input.data);
            out.push(&layer.recurrent.data);
            out.push(&layer.bias);
        }
        out.push(&self.head);
        out.push(std::slice::from_ref(&self.head_bias));
        out
    }

    pub fn slices_mut(&mut self) -> Vec<&mut [f64]> {
        let mut out: Vec<&mut [f64]> = Vec::with_capacity(self.layers.len() * 3 + 2);
        for layer in self.layers.iter_mut() {
            out.push(&mut layer.input.data);
            out.push(&mut layer.recurrent.data);
            out.push(&mut layer.bias);
        }
        out.push(&mut self.head);
        out.push(std::slice::from_mut(&mut self.head_bias));
        out
    }

    /// Multiplies every gradient by `factor`.
    pub fn scale(&mut self, factor: f64) {
        for slice in self.slices_mut() {
            slice.iter_mut().for_each(|g| *g *= factor);
        }
    }

    /// Rescales the whole gradient so its L2 norm is at most `max_norm`.
    pub fn clip_norm(&mut self, max_norm: f64) {
        if max_norm <= 0.0 {
            return;
        }
        let norm = self.all_parameters().map(|g| g * g).sum::<f64>().sqrt();
        if norm > max_norm {
            self.scale(max_norm / norm);
        }
    }
}

// ---------------------------------------------------------------------------
// Optimiser
// ---------------------------------------------------------------------------

/// Adam with the usual defaults (beta1 0.9, beta2 0.999, epsilon 1e-7).
#[derive(Debug, Clone)]
pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    step: i32,
    first_moment: Vec<Vec<f64>>,
    second_moment: Vec<Vec<f64>>,
}

impl Adam {
    pub fn new(network: &RecurrentNetwork, learning_rate: f64) -> Self {
        let shapes: Vec<Vec<f64>> = network.slices().iter().map(|s| vec![0.0; s.len()]).collect();
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            first_moment: shapes.clone(),
            second_moment: shapes,
        }
    }

    pub fn apply(&mut self, network: &mut RecurrentNetwork, grads: &RecurrentNetwork) {
        self.step += 1;
        let correction1 = 1.0 - self.beta1.powi(self.step);
        let correction2 = 1.0 - self.beta2.powi(self.step);

        let params = network.slices_mut();
        let gradients = grads.slices();
        for (k, (param, grad)) in params.into_iter().zip(gradients).enumerate() {
            let m = &mut self.first_moment[k];
            let v = &mut self.second_moment[k];
            for i in 0..param.len() {
                let g = grad[i];
                m[i] = self.beta1 * m[i] + (1.0 - self.beta1) * g;
                v[i] = self.beta2 * v[i] + (1.0 - self.beta2) * g * g;
                let m_hat = m[i] / correction1;
                let v_hat = v[i] / correction2;
                param[i] -= self.learning_rate * m_hat / (v_hat.sqrt() + self.epsilon);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

pub fn binary_cross_entropy(p: f64, label: f64) -> f64 {
    let p = p.clamp(1e-7, 1.0 - 1e-7);
    -(label * p.ln() + (1.0 - label) * (1.0 - p).ln())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn window(len: usize, seed: u64) -> Vec<[f64; 3]> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len)
            .map(|_| {
                [
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                    rng.random_range(-1.0..1.0),
                ]
            })
            .collect()
    }

    fn loss(net: &RecurrentNetwork, w: &[[f64; 3]], label: f64) -> f64 {
        binary_cross_entropy(net.predict(w), label)
    }

    #[test]
    fn test_sigmoid_is_stable_at_extremes() {
        assert_eq!(sigmoid(0.0), 0.5);
        assert!(sigmoid(800.0) <= 1.0);
        assert!(sigmoid(-800.0) >= 0.0);
        assert!(sigmoid(-800.0).is_finite());
    }

    #[test]
    fn test_prediction_is_a_probability() {
        let mut rng = StdRng::seed_from_u64(1);
        let net = RecurrentNetwork::new(3, &[8, 4], &mut rng);
        let p = net.predict(&window(12, 2));
        assert!((0.0..=1.0).contains(&p), "got {}", p);
        assert!(net.is_consistent(3));
        assert!(!net.is_consistent(4));
    }

    #[test]
    fn test_gradients_match_finite_differences() {
        let mut rng = StdRng::seed_from_u64(11);
        let net = RecurrentNetwork::new(3, &[5, 3], &mut rng);
        let w = window(6, 12);
        let label = 1.0;

        let mut grads = net.zeros_like();
        net.accumulate_gradients(&w, label, &mut grads);
        let analytic: Vec<f64> = grads.slices().concat();

        let eps = 1e-6;
        let total = analytic.len();
        // Spot-check a spread of parameters across every tensor.
        for index in (0..total).step_by(7).chain([total - 1]) {
            let mut plus = net.clone();
            let mut minus = net.clone();
            nth_param(&mut plus, index, eps);
            nth_param(&mut minus, index, -eps);
            let numeric = (loss(&plus, &w, label) - loss(&minus, &w, label)) / (2.0 * eps);
            assert!(
                (numeric - analytic[index]).abs() < 1e-5,
                "parameter {}: numeric {} vs analytic {}",
                index,
                numeric,
                analytic[index]
            );
        }
    }

    fn nth_param(net: &mut RecurrentNetwork, mut index: usize, delta: f64) {
        for slice in net.slices_mut() {
            if index < slice.len() {
                slice[index] += delta;
                return;
            }
            index -= slice.len();
        }
    }

    #[test]
    fn test_adam_reduces_loss_on_a_single_window() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut net = RecurrentNetwork::new(3, &[6], &mut rng);
        let w = window(10, 9);
        let before = loss(&net, &w, 1.0);

        let mut adam = Adam::new(&net, 0.01);
        for _ in 0..50 {
            let mut grads = net.zeros_like();
            net.accumulate_gradients(&w, 1.0, &mut grads);
            adam.apply(&mut net, &grads);
        }
        let after = loss(&net, &w, 1.0);
        assert!(after < before, "loss should fall: {} -> {}", before, after);
    }

    #[test]
    fn test_clip_norm_bounds_gradient() {
        let mut rng = StdRng::seed_from_u64(3);
        let net = RecurrentNetwork::new(3, &[4], &mut rng);
        let mut grads = net.zeros_like();
        grads.head.iter_mut().for_each(|g| *g = 10.0);
        grads.clip_norm(1.0);
        let norm = grads.slices().concat().iter().map(|g| g * g).sum::<f64>().sqrt();
        assert!((norm - 1.0).abs() < 1e-9, "got {}", norm);
    }
}
