//! Fully connected feed-forward network.
//!
//! ## Forward pass
//!
//! ```text
//! a⁰ = x
//! zˡ = Wˡ aˡ + bˡ
//! aˡ⁺¹ = f(zˡ)     f = hidden activation, output activation on the last layer
//! ```
//!
//! ## Backward pass
//!
//! ```text
//! δᴸ = ∂loss/∂aᴸ⁺¹ ⊙ f'(zᴸ)
//! ∂Wˡ = δˡ ⊗ aˡ,  ∂bˡ = δˡ
//! δˡ⁻¹ = (Wˡ)ᵀ δˡ ⊙ f'(zˡ⁻¹)
//! ```

use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EsinetError, EsinetResult};

/// Layer nonlinearity.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    /// f(x) = x, f'(x) = 1
    Linear,
    /// f(x) = tanh(x), f'(x) = 1 - tanh²(x)
    Tanh,
    /// f(x) = max(0, x)
    Relu,
}

impl Activation {
    pub fn apply(self, z: &Array1<f32>) -> Array1<f32> {
        match self {
            Activation::Linear => z.clone(),
            Activation::Tanh => z.mapv(f32::tanh),
            Activation::Relu => z.mapv(|v| v.max(0.0)),
        }
    }

    pub fn apply_matrix(self, z: &Array2<f32>) -> Array2<f32> {
        match self {
            Activation::Linear => z.clone(),
            Activation::Tanh => z.mapv(f32::tanh),
            Activation::Relu => z.mapv(|v| v.max(0.0)),
        }
    }

    /// f'(z), evaluated at the pre-activation.
    pub fn derivative(self, z: &Array1<f32>) -> Array1<f32> {
        match self {
            Activation::Linear => Array1::ones(z.len()),
            Activation::Tanh => z.mapv(|v| 1.0 - v.tanh().powi(2)),
            Activation::Relu => z.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 }),
        }
    }
}

/// Dense network with one weight matrix per layer.
///
/// `w[l]` has shape `(dims[l + 1], dims[l])`, `b[l]` has length `dims[l + 1]`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseNetwork {
    /// Layer widths, input first
    pub dims: Vec<usize>,
    pub w: Vec<Array2<f32>>,
    pub b: Vec<Array1<f32>>,
    pub hidden_activation: Activation,
    pub output_activation: Activation,
}

/// Pre-activations and activations of one forward pass.
#[derive(Debug, Clone)]
pub struct Trace {
    /// `z[l]`: pre-activation of layer `l + 1`
    pub z: Vec<Array1<f32>>,
    /// `a[l]`: input to layer `l`; `a.last()` is the network output
    pub a: Vec<Array1<f32>>,
}

impl DenseNetwork {
    /// Create a network with Glorot-uniform weights and zero biases.
    ///
    /// # Errors
    /// `InvalidConfig` for fewer than two layers or a zero-width layer.
    pub fn new<R: Rng + ?Sized>(
        dims: Vec<usize>,
        hidden_activation: Activation,
        output_activation: Activation,
        rng: &mut R,
    ) -> EsinetResult<Self> {
        if dims.len() < 2 {
            return Err(EsinetError::InvalidConfig(
                "Must have at least 2 layers (input and output)".to_string(),
            ));
        }
        if dims.contains(&0) {
            return Err(EsinetError::InvalidConfig(format!(
                "layer widths must be > 0, got {dims:?}"
            )));
        }

        let mut w = Vec::with_capacity(dims.len() - 1);
        let mut b = Vec::with_capacity(dims.len() - 1);
        for pair in dims.windows(2) {
            let (fan_in, fan_out) = (pair[0], pair[1]);
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            w.push(Array2::random_using(
                (fan_out, fan_in),
                Uniform::new(-limit, limit),
                rng,
            ));
            b.push(Array1::zeros(fan_out));
        }

        Ok(Self {
            dims,
            w,
            b,
            hidden_activation,
            output_activation,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.dims[0]
    }

    pub fn output_dim(&self) -> usize {
        self.dims[self.dims.len() - 1]
    }

    pub fn n_layers(&self) -> usize {
        self.w.len()
    }

    /// Number of trainable parameters.
    pub fn n_params(&self) -> usize {
        self.w.iter().map(|w| w.len()).sum::<usize>() + self.b.iter().map(|b| b.len()).sum::<usize>()
    }

    fn activation_of(&self, layer: usize) -> Activation {
        if layer + 1 == self.n_layers() {
            self.output_activation
        } else {
            self.hidden_activation
        }
    }

    /// Forward pass of one sample, keeping everything backprop needs.
    pub fn forward(&self, x: ArrayView1<'_, f32>) -> EsinetResult<Trace> {
        if x.len() != self.input_dim() {
            return Err(EsinetError::ShapeMismatch(format!(
                "Input dim: expected {}, got {}",
                self.input_dim(),
                x.len()
            )));
        }
        let mut z = Vec::with_capacity(self.n_layers());
        let mut a = Vec::with_capacity(self.n_layers() + 1);
        a.push(x.to_owned());
        for l in 0..self.n_layers() {
            let zl = self.w[l].dot(&a[l]) + &self.b[l];
            a.push(self.activation_of(l).apply(&zl));
            z.push(zl);
        }
        Ok(Trace { z, a })
    }

    /// Outputs for a batch of inputs (one sample per row).
    pub fn predict(&self, x: &Array2<f32>) -> EsinetResult<Array2<f32>> {
        if x.ncols() != self.input_dim() {
            return Err(EsinetError::ShapeMismatch(format!(
                "Input dim: expected {}, got {}",
                self.input_dim(),
                x.ncols()
            )));
        }
        let mut a = x.clone();
        for l in 0..self.n_layers() {
            let z = a.dot(&self.w[l].t()) + &self.b[l].view().insert_axis(Axis(0));
            a = self.activation_of(l).apply_matrix(&z);
        }
        Ok(a)
    }

    /// Gradients of the loss with respect to every weight and bias, given
    /// `grad_out = ∂loss/∂output` for the traced sample.
    pub fn backward(&self, trace: &Trace, grad_out: &Array1<f32>) -> (Vec<Array2<f32>>, Vec<Array1<f32>>) {
        let n = self.n_layers();
        let mut dw: Vec<Array2<f32>> = self.w.iter().map(|w| Array2::zeros(w.dim())).collect();
        let mut db: Vec<Array1<f32>> = self.b.iter().map(|b| Array1::zeros(b.len())).collect();

        let mut delta = grad_out * &self.activation_of(n - 1).derivative(&trace.z[n - 1]);
        for l in (0..n).rev() {
            let delta_col = delta.view().insert_axis(Axis(1));
            let a_row = trace.a[l].view().insert_axis(Axis(0));
            dw[l] = &delta_col * &a_row;
            db[l].assign(&delta);
            if l > 0 {
                let back = self.w[l].t().dot(&delta);
                delta = &back * &self.activation_of(l - 1).derivative(&trace.z[l - 1]);
            }
        }
        (dw, db)
    }
}
