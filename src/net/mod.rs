//! Neural-network inverse solution.
//!
//! A [`Net`] learns the mapping from sensor data to source activity on a
//! [`Simulation`] and applies it to real recordings. Two input layouts are
//! supported:
//!
//! - [`ModelType::Fc`]: one time sample (all channels) per prediction
//! - [`ModelType::Temporal`]: a window of `2 · context + 1` samples centered on
//!   the predicted one; edges are padded by repeating the first/last sample
//!
//! Every input is common-average referenced and scaled to unit peak, every
//! target source vector is scaled to unit peak. Predictions are rescaled so
//! that their leadfield projection fits the recording in the least-squares
//! sense.
//!
//! A trained network is stored as two files: `model.json` with the layer
//! weights and `<name>.json` with everything else.

pub mod network;
pub mod training;

pub use network::{Activation, DenseNetwork};
pub use training::{EpochMetrics, Optimizer, OptimizerState, WeightedHuber};

use ndarray::{concatenate, Array2, ArrayView2, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info};

use crate::data::{Info, SensorData, SourceEstimate};
use crate::error::{EsinetError, EsinetResult};
use crate::forward::io::{read_json, write_json};
use crate::forward::ForwardModel;
use crate::simulation::Simulation;
use training::{evaluate, extract_batch, shuffle_indices, train_epoch_parallel};

/// File holding the layer weights of a saved network.
pub const MODEL_FILE: &str = "model.json";

/// Input layout of the network.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ModelType {
    /// Single time sample in, single source vector out
    Fc,
    /// `context` samples on either side of the predicted one
    Temporal { context: usize },
}

impl ModelType {
    fn window(self) -> usize {
        match self {
            ModelType::Fc => 0,
            ModelType::Temporal { context } => context,
        }
    }
}

/// Architecture hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    pub model_type: ModelType,
    pub n_dense_layers: usize,
    pub n_dense_units: usize,
    pub activation: Activation,
    /// Seed for weight initialization, the validation split and shuffling
    pub seed: Option<u64>,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            model_type: ModelType::Fc,
            n_dense_layers: 1,
            n_dense_units: 300,
            activation: Activation::Tanh,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainOptions {
    pub learning_rate: f32,
    /// Fraction of the training pairs held out for validation
    pub validation_split: f32,
    pub epochs: usize,
    pub batch_size: usize,
    /// Huber transition point
    pub delta: f32,
    /// Loss weight of activity predicted where the target is zero
    pub false_positive_penalty: f32,
    pub optimizer: Optimizer,
    /// Stop after this many epochs without validation improvement and keep
    /// the best weights
    pub patience: Option<usize>,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            validation_split: 0.05,
            epochs: 50,
            batch_size: 8,
            delta: 1.0,
            false_positive_penalty: 2.0,
            optimizer: Optimizer::Adam,
            patience: Some(7),
        }
    }
}

impl TrainOptions {
    fn validate(&self) -> EsinetResult<()> {
        if self.batch_size == 0 {
            return Err(EsinetError::InvalidConfig("Batch size must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.validation_split) {
            return Err(EsinetError::InvalidConfig(format!(
                "validation_split must be in [0, 1), got {}",
                self.validation_split
            )));
        }
        if !(self.learning_rate > 0.0 && self.delta > 0.0) {
            return Err(EsinetError::InvalidConfig(
                "learning_rate and delta must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Trainable sensor-to-source mapping for one forward model.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Net {
    pub config: NetConfig,
    /// Fixed-orientation leadfield, rows ordered as `forward_ch_names`
    leadfield: Array2<f64>,
    forward_ch_names: Vec<String>,
    pub vertices: [Vec<usize>; 2],
    pub subject: String,
    /// Channels the network reads, in input order
    pub ch_names: Vec<String>,
    pub history: Vec<EpochMetrics>,
    #[serde(skip)]
    model: Option<DenseNetwork>,
}

impl Net {
    /// # Errors
    /// `InvalidConfig` for a network without hidden units.
    pub fn new(fwd: &ForwardModel, config: NetConfig) -> EsinetResult<Self> {
        if config.n_dense_layers > 0 && config.n_dense_units == 0 {
            return Err(EsinetError::InvalidConfig(
                "n_dense_units must be > 0".to_string(),
            ));
        }
        Ok(Self {
            config,
            leadfield: fwd.to_fixed().leadfield,
            forward_ch_names: fwd.ch_names.clone(),
            vertices: fwd.vertices(),
            subject: fwd.subject().to_string(),
            ch_names: fwd.ch_names.clone(),
            history: Vec::new(),
            model: None,
        })
    }

    pub fn n_dipoles(&self) -> usize {
        self.leadfield.ncols()
    }

    pub fn is_fitted(&self) -> bool {
        self.model.is_some()
    }

    pub fn model(&self) -> Option<&DenseNetwork> {
        self.model.as_ref()
    }

    fn input_dim(&self) -> usize {
        self.ch_names.len() * (2 * self.config.model_type.window() + 1)
    }

    /// Train on every time sample of every simulated trial.
    ///
    /// Replaces any previous weights. Returns the per-epoch history.
    pub fn fit(&mut self, sim: &Simulation, options: &TrainOptions) -> EsinetResult<&[EpochMetrics]> {
        options.validate()?;
        if sim.n_samples() == 0 {
            return Err(EsinetError::InvalidConfig(
                "simulation contains no samples".to_string(),
            ));
        }
        let start = Instant::now();
        self.ch_names = sim.info.ch_names.clone();

        let pairs = sim
            .eeg_data
            .par_iter()
            .zip(sim.source_data.par_iter())
            .map(|(epochs, stc)| {
                if stc.n_dipoles() != self.n_dipoles() {
                    return Err(EsinetError::ShapeMismatch(format!(
                        "sources have {} dipoles, network expects {}",
                        stc.n_dipoles(),
                        self.n_dipoles()
                    )));
                }
                let eeg = self.prepare_eeg(epochs.trial(0), &epochs.info)?;
                Ok((self.inputs_for(&eeg), targets_for(&stc.data)))
            })
            .collect::<EsinetResult<Vec<_>>>()?;
        let inputs = stack_rows(pairs.iter().map(|(x, _)| x.view()).collect())?;
        let targets = stack_rows(pairs.iter().map(|(_, y)| y.view()).collect())?;
        drop(pairs);

        let mut rng = StdRng::seed_from_u64(self.config.seed.unwrap_or_else(|| rand::thread_rng().gen()));
        let n_total = inputs.nrows();
        let mut order: Vec<usize> = (0..n_total).collect();
        shuffle_indices(&mut order, &mut rng);
        let n_val = ((n_total as f32 * options.validation_split).round() as usize).min(n_total - 1);
        let (val_idx, train_idx) = order.split_at(n_val);
        let (train_x, train_y) = extract_batch(&inputs, &targets, train_idx);
        let (val_x, val_y) = extract_batch(&inputs, &targets, val_idx);

        let mut dims = vec![self.input_dim()];
        dims.extend(std::iter::repeat(self.config.n_dense_units).take(self.config.n_dense_layers));
        dims.push(self.n_dipoles());
        let mut model = DenseNetwork::new(dims, self.config.activation, Activation::Linear, &mut rng)?;
        let mut optimizer = OptimizerState::new(options.optimizer, options.learning_rate, &model);
        let loss = WeightedHuber {
            delta: options.delta,
            false_positive_penalty: options.false_positive_penalty,
        };
        debug!(
            n_params = model.n_params(),
            n_train = train_x.nrows(),
            n_val = val_x.nrows(),
            "starting training"
        );

        self.history.clear();
        let mut best: Option<(f32, DenseNetwork)> = None;
        let mut stale = 0usize;
        for epoch in 0..options.epochs {
            let (train_loss, num_batches) = train_epoch_parallel(
                &mut model,
                &mut optimizer,
                &train_x,
                &train_y,
                options.batch_size,
                &loss,
                &mut rng,
            )?;
            let val_loss = if n_val > 0 {
                Some(evaluate(&model, &val_x, &val_y, &loss)?)
            } else {
                None
            };
            info!(epoch, train_loss, val_loss = ?val_loss, "epoch complete");
            self.history.push(EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                num_batches,
                num_samples: train_x.nrows(),
            });

            let (Some(patience), Some(current)) = (options.patience, val_loss) else {
                continue;
            };
            let improved = best.as_ref().map_or(true, |(best_loss, _)| current < *best_loss);
            if improved {
                best = Some((current, model.clone()));
                stale = 0;
            } else {
                stale += 1;
                if stale >= patience {
                    info!(epoch, "early stopping");
                    break;
                }
            }
        }
        if let Some((_, best_model)) = best {
            model = best_model;
        }
        self.model = Some(model);

        info!(
            epochs = self.history.len(),
            elapsed_secs = start.elapsed().as_secs_f32(),
            "training complete"
        );
        Ok(&self.history)
    }

    /// One source estimate per trial of `data`.
    ///
    /// # Errors
    /// `InvalidConfig` before [`fit`](Self::fit), `UnsupportedContainer` for
    /// continuous data, `ShapeMismatch` when a training channel is missing.
    pub fn predict(&self, data: &SensorData) -> EsinetResult<Vec<SourceEstimate>> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EsinetError::InvalidConfig("network has not been fitted".to_string()))?;
        let info = data.info();
        let leadfield = self.prepare_leadfield(info)?;

        data.trials()?
            .into_iter()
            .map(|(trial, tmin)| {
                let eeg = self.prepare_eeg(trial.view(), info)?;
                let pred = model.predict(&self.inputs_for(&eeg))?;
                let mut sources = pred.t().mapv(f64::from);

                let projected = leadfield.dot(&sources);
                let energy = projected.iter().map(|v| v * v).sum::<f64>();
                let scale = if energy > 0.0 {
                    (&projected * &eeg).sum() / energy
                } else {
                    0.0
                };
                sources *= scale;
                SourceEstimate::new(sources, self.vertices.clone(), tmin, 1.0 / info.sfreq, self.subject.clone())
            })
            .collect()
    }

    /// Rows of `values` (indexed like `names`) rearranged into the network's
    /// channel order.
    fn select_channels(&self, names: &[String], values: ArrayView2<'_, f64>) -> EsinetResult<Array2<f64>> {
        let rows = self
            .ch_names
            .iter()
            .map(|ch| {
                names.iter().position(|n| n == ch).ok_or_else(|| {
                    EsinetError::ShapeMismatch(format!("channel {ch} missing from data"))
                })
            })
            .collect::<EsinetResult<Vec<usize>>>()?;
        Ok(values.select(Axis(0), &rows))
    }

    /// Pick the network's channels and apply the common average reference.
    fn prepare_eeg(&self, trial: ArrayView2<'_, f64>, info: &Info) -> EsinetResult<Array2<f64>> {
        let mut eeg = self.select_channels(&info.ch_names, trial)?;
        subtract_row_mean(&mut eeg, &self.eeg_rows(info));
        Ok(eeg)
    }

    fn prepare_leadfield(&self, info: &Info) -> EsinetResult<Array2<f64>> {
        let mut leadfield = self.select_channels(&self.forward_ch_names, self.leadfield.view())?;
        subtract_row_mean(&mut leadfield, &self.eeg_rows(info));
        Ok(leadfield)
    }

    /// Positions of the EEG channels in the network's channel order.
    fn eeg_rows(&self, info: &Info) -> Vec<usize> {
        let eeg = info.eeg_indices();
        self.ch_names
            .iter()
            .enumerate()
            .filter(|(_, ch)| eeg.iter().any(|&i| &info.ch_names[i] == *ch))
            .map(|(row, _)| row)
            .collect()
    }

    /// One network input per time sample (rows), scaled to unit peak.
    fn inputs_for(&self, eeg: &Array2<f64>) -> Array2<f32> {
        let (n_channels, n_times) = eeg.dim();
        let context = self.config.model_type.window();
        let width = 2 * context + 1;
        let mut inputs = Array2::zeros((n_times, n_channels * width));
        for t in 0..n_times {
            let mut row = inputs.row_mut(t);
            for k in 0..width {
                // clamp the window to the trial
                let src = (t + k).saturating_sub(context).min(n_times - 1);
                for ch in 0..n_channels {
                    row[k * n_channels + ch] = eeg[[ch, src]] as f32;
                }
            }
            let peak = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            if peak > 0.0 {
                row /= peak;
            }
        }
        inputs
    }

    /// Write `model.json` and `<name>.json` into `dir`, creating it if needed.
    ///
    /// # Errors
    /// `InvalidConfig` before [`fit`](Self::fit); `Io`/`Json` on write failures.
    pub fn save(&self, dir: impl AsRef<Path>, name: &str) -> EsinetResult<()> {
        let model = self
            .model
            .as_ref()
            .ok_or_else(|| EsinetError::InvalidConfig("network has not been fitted".to_string()))?;
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| EsinetError::io(dir, e))?;
        write_json(&dir.join(MODEL_FILE), model)?;
        write_json(&dir.join(format!("{name}.json")), self)?;
        info!(path = %dir.display(), name, "saved network");
        Ok(())
    }
}

/// Load a network written by [`Net::save`].
///
/// # Errors
/// `ShapeMismatch` when the weights do not fit the stored channels and dipoles.
pub fn load_net(dir: impl AsRef<Path>, name: &str) -> EsinetResult<Net> {
    let dir = dir.as_ref();
    let mut net: Net = read_json(&dir.join(format!("{name}.json")))?;
    let model: DenseNetwork = read_json(&dir.join(MODEL_FILE))?;
    if model.input_dim() != net.input_dim() || model.output_dim() != net.n_dipoles() {
        return Err(EsinetError::ShapeMismatch(format!(
            "stored weights map {} inputs to {} outputs, network needs {} to {}",
            model.input_dim(),
            model.output_dim(),
            net.input_dim(),
            net.n_dipoles()
        )));
    }
    net.model = Some(model);
    Ok(net)
}

/// Source vectors as rows, each scaled to unit peak.
fn targets_for(sources: &Array2<f64>) -> Array2<f32> {
    let mut targets = sources.t().mapv(|v| v as f32);
    for mut row in targets.rows_mut() {
        let peak = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
        if peak > 0.0 {
            row /= peak;
        }
    }
    targets
}

/// Common average reference over `rows` only; the other rows are untouched.
fn subtract_row_mean(values: &mut Array2<f64>, rows: &[usize]) {
    if let Some(mean) = values.select(Axis(0), rows).mean_axis(Axis(0)) {
        for &row in rows {
            let mut row = values.row_mut(row);
            row -= &mean;
        }
    }
}

fn stack_rows(parts: Vec<ArrayView2<'_, f32>>) -> EsinetResult<Array2<f32>> {
    concatenate(Axis(0), &parts).map_err(|e| EsinetError::ShapeMismatch(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::ChannelType;
    use crate::simulation::tests::tiny_simulation;
    use crate::simulation::DurationOfTrial;

    fn quick_options() -> TrainOptions {
        TrainOptions {
            epochs: 3,
            batch_size: 4,
            learning_rate: 0.01,
            validation_split: 0.2,
            ..TrainOptions::default()
        }
    }

    fn small_config(model_type: ModelType) -> NetConfig {
        NetConfig {
            model_type,
            n_dense_units: 16,
            seed: Some(1),
            ..NetConfig::default()
        }
    }

    #[test]
    fn test_predict_requires_fit() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.0), 2, false);
        let net = Net::new(&sim.forward, NetConfig::default()).expect("net");
        let data = SensorData::from(sim.eeg_data[0].clone());
        assert!(matches!(net.predict(&data), Err(EsinetError::InvalidConfig(_))));
    }

    #[test]
    fn test_fit_records_history() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.05), 6, false);
        let mut net = Net::new(&sim.forward, small_config(ModelType::Fc)).expect("net");
        let history = net.fit(&sim, &quick_options()).expect("fit");
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|m| m.train_loss.is_finite() && m.val_loss.is_some()));
        assert_eq!(net.model().expect("model").dims, vec![3, 16, 8]);
    }

    #[test]
    fn test_temporal_window_width() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.05), 3, false);
        let mut net = Net::new(&sim.forward, small_config(ModelType::Temporal { context: 2 })).expect("net");
        net.fit(&sim, &quick_options()).expect("fit");
        assert_eq!(net.model().expect("model").input_dim(), 15);
        let stcs = net
            .predict(&SensorData::from(sim.eeg_data[1].clone()))
            .expect("predict");
        assert_eq!(stcs[0].data.dim(), (8, 5));
    }

    #[test]
    fn test_inputs_have_unit_peak() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.05), 1, false);
        let net = Net::new(&sim.forward, small_config(ModelType::Temporal { context: 1 })).expect("net");
        let eeg = net
            .prepare_eeg(sim.eeg_data[0].trial(0), &sim.info)
            .expect("prepare");
        let inputs = net.inputs_for(&eeg);
        assert_eq!(inputs.dim(), (5, 9));
        for row in inputs.rows() {
            let peak = row.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            assert!((peak - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_average_reference_skips_meg_channels() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.05), 1, false);
        let net = Net::new(&sim.forward, small_config(ModelType::Fc)).expect("net");
        let mut info = sim.info.clone();
        info.ch_types[0] = ChannelType::Mag;
        let trial = sim.eeg_data[0].trial(0);
        let eeg = net.prepare_eeg(trial, &info).expect("prepare");

        let row = net.ch_names.iter().position(|ch| *ch == info.ch_names[0]).expect("channel");
        assert_eq!(eeg.row(row), trial.row(0));
        let rest: Vec<usize> = (0..eeg.nrows()).filter(|&r| r != row).collect();
        let mean = eeg.select(Axis(0), &rest).mean_axis(Axis(0)).expect("mean");
        assert!(mean.iter().all(|v| v.abs() < 1e-9));

        let leadfield = net.prepare_leadfield(&info).expect("leadfield");
        let raw = net
            .select_channels(&net.forward_ch_names, net.leadfield.view())
            .expect("select");
        assert_eq!(leadfield.row(row), raw.row(row));
    }

    #[test]
    fn test_invalid_options() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.0), 2, false);
        let mut net = Net::new(&sim.forward, small_config(ModelType::Fc)).expect("net");
        let bad = TrainOptions {
            validation_split: 1.0,
            ..quick_options()
        };
        assert!(net.fit(&sim, &bad).is_err());
        let bad = TrainOptions {
            batch_size: 0,
            ..quick_options()
        };
        assert!(net.fit(&sim, &bad).is_err());
    }
}
