//! Mini-batch training of a [`DenseNetwork`].
//!
//! Samples of a batch are independent: each one's gradient is computed in
//! parallel with Rayon from a read-only view of the weights, then the
//! gradients are summed sequentially and one optimizer step is applied with
//! the batch average.

use ndarray::{Array1, Array2, ArrayView1};
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::network::DenseNetwork;
use crate::error::{EsinetError, EsinetResult};

/// Huber loss, weighted up where the target is exactly zero so that spurious
/// activity is penalized more than missed activity.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WeightedHuber {
    pub delta: f32,
    pub false_positive_penalty: f32,
}

impl WeightedHuber {
    /// Mean loss over the outputs and its gradient with respect to `pred`.
    #[allow(clippy::cast_precision_loss)]
    pub fn value_and_grad(&self, pred: &Array1<f32>, target: ArrayView1<'_, f32>) -> (f32, Array1<f32>) {
        let n = pred.len().max(1) as f32;
        let mut loss = 0.0f32;
        let mut grad = Array1::zeros(pred.len());
        for (i, (&p, &t)) in pred.iter().zip(target.iter()).enumerate() {
            let weight = if t == 0.0 { self.false_positive_penalty } else { 1.0 };
            let r = p - t;
            let (value, slope) = if r.abs() <= self.delta {
                (0.5 * r * r, r)
            } else {
                (self.delta * (r.abs() - 0.5 * self.delta), self.delta * r.signum())
            };
            loss += weight * value;
            grad[i] = weight * slope / n;
        }
        (loss / n, grad)
    }
}

/// Gradient-based optimizer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Optimizer {
    Sgd,
    #[default]
    Adam,
}

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPS: f32 = 1e-7;

/// Per-parameter optimizer moments.
#[derive(Debug, Clone)]
pub struct OptimizerState {
    kind: Optimizer,
    learning_rate: f32,
    step: i32,
    m_w: Vec<Array2<f32>>,
    v_w: Vec<Array2<f32>>,
    m_b: Vec<Array1<f32>>,
    v_b: Vec<Array1<f32>>,
}

impl OptimizerState {
    pub fn new(kind: Optimizer, learning_rate: f32, net: &DenseNetwork) -> Self {
        let zeros_w = || net.w.iter().map(|w| Array2::zeros(w.dim())).collect::<Vec<_>>();
        let zeros_b = || net.b.iter().map(|b| Array1::zeros(b.len())).collect::<Vec<_>>();
        Self {
            kind,
            learning_rate,
            step: 0,
            m_w: zeros_w(),
            v_w: zeros_w(),
            m_b: zeros_b(),
            v_b: zeros_b(),
        }
    }

    /// Descend along the averaged gradients.
    fn apply(&mut self, net: &mut DenseNetwork, grad_w: &[Array2<f32>], grad_b: &[Array1<f32>]) {
        match self.kind {
            Optimizer::Sgd => {
                for l in 0..net.n_layers() {
                    net.w[l].scaled_add(-self.learning_rate, &grad_w[l]);
                    net.b[l].scaled_add(-self.learning_rate, &grad_b[l]);
                }
            }
            Optimizer::Adam => {
                self.step += 1;
                let c1 = 1.0 - ADAM_BETA1.powi(self.step);
                let c2 = 1.0 - ADAM_BETA2.powi(self.step);
                let lr = self.learning_rate;
                let update = |param: &mut f32, m: &mut f32, v: &mut f32, g: f32| {
                    *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
                    *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
                    *param -= lr * (*m / c1) / ((*v / c2).sqrt() + ADAM_EPS);
                };
                for l in 0..net.n_layers() {
                    ndarray::Zip::from(&mut net.w[l])
                        .and(&mut self.m_w[l])
                        .and(&mut self.v_w[l])
                        .and(&grad_w[l])
                        .for_each(|p, m, v, &g| update(p, m, v, g));
                    ndarray::Zip::from(&mut net.b[l])
                        .and(&mut self.m_b[l])
                        .and(&mut self.v_b[l])
                        .and(&grad_b[l])
                        .for_each(|p, m, v, &g| update(p, m, v, g));
                }
            }
        }
    }
}

/// Statistics of one training epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochMetrics {
    pub epoch: usize,
    /// Average training loss across samples
    pub train_loss: f32,
    /// Average loss on the held-out samples, if any
    pub val_loss: Option<f32>,
    pub num_batches: usize,
    pub num_samples: usize,
}

/// Gradient of a single sample.
#[derive(Debug, Clone)]
struct SampleGradient {
    delta_w: Vec<Array2<f32>>,
    delta_b: Vec<Array1<f32>>,
    loss: f32,
}

// ============================================================================
// Parallel Batch Training
// ============================================================================

/// One optimizer step on a batch (one sample per row). Returns the mean loss.
///
/// # Errors
/// `ShapeMismatch` when the batch does not fit the network.
#[allow(clippy::cast_precision_loss)]
pub fn train_batch_parallel(
    net: &mut DenseNetwork,
    optimizer: &mut OptimizerState,
    batch_inputs: &Array2<f32>,
    batch_targets: &Array2<f32>,
    loss: &WeightedHuber,
) -> EsinetResult<f32> {
    let batch_size = batch_inputs.nrows();
    validate_batch_dims(net, batch_inputs, batch_targets)?;
    if batch_size == 0 {
        return Ok(0.0);
    }

    // Phase 1: per-sample gradients, read-only access to the weights
    let net_ref: &DenseNetwork = net;
    let sample_results: Vec<EsinetResult<SampleGradient>> = (0..batch_size)
        .into_par_iter()
        .map(|i| {
            let trace = net_ref.forward(batch_inputs.row(i))?;
            let output = trace.a.last().ok_or_else(|| {
                EsinetError::InvalidConfig("network has no layers".to_string())
            })?;
            let (value, grad_out) = loss.value_and_grad(output, batch_targets.row(i));
            let (delta_w, delta_b) = net_ref.backward(&trace, &grad_out);
            Ok(SampleGradient {
                delta_w,
                delta_b,
                loss: value,
            })
        })
        .collect();

    // Phase 2: sequential accumulation
    let mut acc_w: Vec<Array2<f32>> = net.w.iter().map(|w| Array2::zeros(w.dim())).collect();
    let mut acc_b: Vec<Array1<f32>> = net.b.iter().map(|b| Array1::zeros(b.len())).collect();
    let mut total_loss = 0.0f32;
    for result in sample_results {
        let grad = result?;
        total_loss += grad.loss;
        for l in 0..net.n_layers() {
            acc_w[l] += &grad.delta_w[l];
            acc_b[l] += &grad.delta_b[l];
        }
    }

    // Phase 3: averaged update
    let scale = 1.0 / batch_size as f32;
    for l in 0..net.n_layers() {
        acc_w[l] *= scale;
        acc_b[l] *= scale;
    }
    optimizer.apply(net, &acc_w, &acc_b);

    Ok(total_loss / batch_size as f32)
}

/// Train over every sample once in shuffled mini-batches.
///
/// # Errors
/// `InvalidConfig` for a zero batch size, `ShapeMismatch` when inputs and
/// targets disagree.
#[allow(clippy::cast_precision_loss)]
pub fn train_epoch_parallel<R: Rng + ?Sized>(
    net: &mut DenseNetwork,
    optimizer: &mut OptimizerState,
    inputs: &Array2<f32>,
    targets: &Array2<f32>,
    batch_size: usize,
    loss: &WeightedHuber,
    rng: &mut R,
) -> EsinetResult<(f32, usize)> {
    let num_samples = inputs.nrows();

    if batch_size == 0 {
        return Err(EsinetError::InvalidConfig(
            "Batch size must be > 0".to_string(),
        ));
    }
    if num_samples != targets.nrows() {
        return Err(EsinetError::ShapeMismatch(format!(
            "Samples mismatch: inputs={}, targets={}",
            num_samples,
            targets.nrows()
        )));
    }

    let mut indices: Vec<usize> = (0..num_samples).collect();
    shuffle_indices(&mut indices, rng);

    let mut total_loss = 0.0f32;
    let num_batches = num_samples.div_ceil(batch_size);
    for batch_idx in 0..num_batches {
        let start = batch_idx * batch_size;
        let end = (start + batch_size).min(num_samples);
        let (batch_inputs, batch_targets) = extract_batch(inputs, targets, &indices[start..end]);
        let batch_loss = train_batch_parallel(net, optimizer, &batch_inputs, &batch_targets, loss)?;
        total_loss += batch_loss * (end - start) as f32;
    }

    let avg = if num_samples == 0 {
        0.0
    } else {
        total_loss / num_samples as f32
    };
    Ok((avg, num_batches))
}

/// Mean loss of the network on a dataset, without updating it.
#[allow(clippy::cast_precision_loss)]
pub fn evaluate(
    net: &DenseNetwork,
    inputs: &Array2<f32>,
    targets: &Array2<f32>,
    loss: &WeightedHuber,
) -> EsinetResult<f32> {
    validate_batch_dims(net, inputs, targets)?;
    if inputs.nrows() == 0 {
        return Ok(0.0);
    }
    let pred = net.predict(inputs)?;
    let total: f32 = pred
        .rows()
        .into_iter()
        .zip(targets.rows())
        .map(|(p, t)| loss.value_and_grad(&p.to_owned(), t).0)
        .sum();
    Ok(total / inputs.nrows() as f32)
}

// ============================================================================
// Shared Helpers
// ============================================================================

/// Validate that batch dimensions match network architecture.
fn validate_batch_dims(
    net: &DenseNetwork,
    batch_inputs: &Array2<f32>,
    batch_targets: &Array2<f32>,
) -> EsinetResult<()> {
    if batch_inputs.ncols() != net.input_dim() {
        return Err(EsinetError::ShapeMismatch(format!(
            "Input dim: expected {}, got {}",
            net.input_dim(),
            batch_inputs.ncols()
        )));
    }
    if batch_targets.ncols() != net.output_dim() {
        return Err(EsinetError::ShapeMismatch(format!(
            "Target dim: expected {}, got {}",
            net.output_dim(),
            batch_targets.ncols()
        )));
    }
    if batch_inputs.nrows() != batch_targets.nrows() {
        return Err(EsinetError::ShapeMismatch(format!(
            "Batch size mismatch: inputs={}, targets={}",
            batch_inputs.nrows(),
            batch_targets.nrows()
        )));
    }
    Ok(())
}

/// Extract a mini-batch from the full dataset using index mapping.
pub(crate) fn extract_batch(
    inputs: &Array2<f32>,
    targets: &Array2<f32>,
    indices: &[usize],
) -> (Array2<f32>, Array2<f32>) {
    let mut batch_inputs = Array2::zeros((indices.len(), inputs.ncols()));
    let mut batch_targets = Array2::zeros((indices.len(), targets.ncols()));

    for (local_idx, &global_idx) in indices.iter().enumerate() {
        batch_inputs
            .row_mut(local_idx)
            .assign(&inputs.row(global_idx));
        batch_targets
            .row_mut(local_idx)
            .assign(&targets.row(global_idx));
    }

    (batch_inputs, batch_targets)
}

/// Shuffle indices in-place using Fisher-Yates algorithm.
pub(crate) fn shuffle_indices<R: Rng + ?Sized>(indices: &mut [usize], rng: &mut R) {
    for i in (1..indices.len()).rev() {
        let j = rng.gen_range(0..=i);
        indices.swap(i, j);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::network::Activation;
    use ndarray::arr1;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn huber() -> WeightedHuber {
        WeightedHuber {
            delta: 1.0,
            false_positive_penalty: 2.0,
        }
    }

    #[test]
    fn test_huber_quadratic_and_linear_regions() {
        let loss = WeightedHuber {
            delta: 1.0,
            false_positive_penalty: 1.0,
        };
        let target = arr1(&[1.0f32, 1.0]);
        let (value, grad) = loss.value_and_grad(&arr1(&[1.5, 4.0]), target.view());
        // 0.5 * 0.25 and 1 * (3 - 0.5), averaged over two outputs
        assert!((value - (0.125 + 2.5) / 2.0).abs() < 1e-6);
        assert!((grad[0] - 0.25).abs() < 1e-6);
        assert!((grad[1] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_false_positives_cost_more() {
        let loss = huber();
        let (fp, _) = loss.value_and_grad(&arr1(&[0.5]), arr1(&[0.0]).view());
        let (miss, _) = loss.value_and_grad(&arr1(&[0.5]), arr1(&[1.0]).view());
        assert!(fp > miss);
    }

    #[test]
    fn test_shuffle_is_permutation() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut idx: Vec<usize> = (0..20).collect();
        shuffle_indices(&mut idx, &mut rng);
        let mut sorted = idx.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut rng = StdRng::seed_from_u64(9);
        let net = DenseNetwork::new(vec![3, 8, 2], Activation::Tanh, Activation::Linear, &mut rng)
            .expect("network");
        let inputs = Array2::from_shape_fn((16, 3), |(i, j)| ((i * 3 + j) % 5) as f32 * 0.2 - 0.4);
        let targets = Array2::from_shape_fn((16, 2), |(i, k)| inputs[[i, k]] - 0.5 * inputs[[i, 2]]);
        let loss = huber();
        for kind in [Optimizer::Sgd, Optimizer::Adam] {
            let mut trained = net.clone();
            let mut opt = OptimizerState::new(kind, 0.05, &trained);
            let before = evaluate(&trained, &inputs, &targets, &loss).expect("eval");
            for _ in 0..50 {
                train_epoch_parallel(&mut trained, &mut opt, &inputs, &targets, 4, &loss, &mut rng)
                    .expect("epoch");
            }
            let after = evaluate(&trained, &inputs, &targets, &loss).expect("eval");
            assert!(after < before, "{kind:?}: {after} >= {before}");
        }
    }

    #[test]
    fn test_batch_dimension_mismatch() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut net = DenseNetwork::new(vec![2, 3, 1], Activation::Tanh, Activation::Linear, &mut rng)
            .expect("network");
        let mut opt = OptimizerState::new(Optimizer::Sgd, 0.1, &net);
        let bad_inputs = Array2::zeros((4, 3));
        let targets = Array2::zeros((4, 1));
        assert!(train_batch_parallel(&mut net, &mut opt, &bad_inputs, &targets, &huber()).is_err());
        assert!(train_epoch_parallel(&mut net, &mut opt, &Array2::zeros((4, 2)), &targets, 0, &huber(), &mut rng).is_err());
    }
}
