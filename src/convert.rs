//! Packaging raw arrays into typed containers and reshaping between the
//! temporal and single-sample layouts.

use ndarray::{Array2, Array3, ArrayViewD, Axis, Ix1, Ix2};
use rayon::prelude::*;
use std::path::Path;

use crate::data::{Epochs, Evoked, Info, SimulationInfo, SourceEstimate};
use crate::error::{EsinetError, EsinetResult};
use crate::forward::{load_info, ForwardModel};
use crate::simulation::{DurationOfTrial, Simulation};

/// Wrap a dipoles × times (or dipoles-only) array as a [`SourceEstimate`].
///
/// A 1-D input is treated as a single time sample.
///
/// # Errors
/// `ShapeMismatch` when the leading axis is not the forward model's dipole count
/// or the input has more than two axes.
pub fn source_to_source_estimate(
    data: ArrayViewD<'_, f64>,
    fwd: &ForwardModel,
    sfreq: f64,
    subject: &str,
    simulation_info: Option<SimulationInfo>,
    tmin: f64,
) -> EsinetResult<SourceEstimate> {
    let data: Array2<f64> = match data.ndim() {
        1 => data
            .into_dimensionality::<Ix1>()
            .map_err(|e| EsinetError::ShapeMismatch(e.to_string()))?
            .insert_axis(Axis(1))
            .to_owned(),
        2 => data
            .into_dimensionality::<Ix2>()
            .map_err(|e| EsinetError::ShapeMismatch(e.to_string()))?
            .to_owned(),
        n => {
            return Err(EsinetError::ShapeMismatch(format!(
                "source data must have 1 or 2 axes, got {n}"
            )))
        }
    };
    let mut stc = SourceEstimate::new(data, fwd.vertices(), tmin, 1.0 / sfreq, subject)?;
    stc.simulation_info = simulation_info;
    Ok(stc)
}

/// One single-trial [`Epochs`] per channels × times array.
///
/// When the montage contains EEG channels every trial is re-referenced to the
/// common average. The parallel path keeps input order.
pub fn eeg_to_epochs(data: &[Array2<f64>], info: &Info, parallel: bool) -> EsinetResult<Vec<Epochs>> {
    let make = |trial: &Array2<f64>| -> EsinetResult<Epochs> {
        let mut epochs = Epochs::single(info.clone(), trial.clone(), 0.0)?;
        if info.has_eeg() {
            epochs.set_average_reference();
        }
        Ok(epochs)
    };
    if parallel {
        data.par_iter().map(make).collect()
    } else {
        data.iter().map(make).collect()
    }
}

/// [`eeg_to_epochs`] with the channel info read from a forward bundle directory.
pub fn eeg_to_epochs_from_bundle(
    data: &[Array2<f64>],
    bundle_dir: impl AsRef<Path>,
    parallel: bool,
) -> EsinetResult<Vec<Epochs>> {
    let info = load_info(bundle_dir)?;
    eeg_to_epochs(data, &info, parallel)
}

/// Project source activity through the leadfield rows of `info`'s channels.
pub fn get_eeg_from_source(
    stc: &SourceEstimate,
    fwd: &ForwardModel,
    info: &Info,
    tmin: f64,
) -> EsinetResult<Evoked> {
    let leadfield = fwd.to_fixed().pick_channels(&info.ch_names)?;
    if leadfield.ncols() != stc.n_dipoles() {
        return Err(EsinetError::ShapeMismatch(format!(
            "leadfield has {} dipoles, source estimate has {}",
            leadfield.ncols(),
            stc.n_dipoles()
        )));
    }
    Evoked::new(info.clone(), leadfield.dot(&stc.data), tmin)
}

/// Non-temporal copy of a simulation: every time sample of every trial
/// becomes a sample of its own.
pub fn convert_simulation_temporal_to_single(sim: &Simulation) -> EsinetResult<Simulation> {
    let mut eeg_data = Vec::new();
    let mut source_data = Vec::new();
    let mut simulation_info = Vec::new();

    for (i, (epochs, stc)) in sim.eeg_data.iter().zip(&sim.source_data).enumerate() {
        let trial = epochs.trial(0);
        if trial.ncols() != stc.n_times() {
            return Err(EsinetError::ShapeMismatch(format!(
                "sample {i}: {} sensor samples vs {} source samples",
                trial.ncols(),
                stc.n_times()
            )));
        }
        for t in 0..trial.ncols() {
            let column = trial.column(t).to_owned().insert_axis(Axis(1));
            eeg_data.push(Epochs::single(epochs.info.clone(), column, epochs.tmin)?);

            let mut single = stc.zeros_like(1);
            single.data.column_mut(0).assign(&stc.data.column(t));
            single.simulation_info = stc.simulation_info.clone();
            source_data.push(single);

            if let Some(si) = sim.simulation_info.get(i) {
                simulation_info.push(si.clone());
            }
        }
    }

    let mut settings = sim.settings.clone();
    settings.duration_of_trial = DurationOfTrial::Fixed(0.0);

    Ok(Simulation {
        forward: sim.forward.clone(),
        info: sim.info.clone(),
        settings,
        parallel: sim.parallel,
        temporal: false,
        eeg_data,
        source_data,
        simulation_info,
    })
}

/// Collapse samples × dipoles × times into (samples · times) × dipoles.
///
/// Row `s * T + t` holds sample `s` at time `t`.
pub fn collapse(x: &Array3<f64>) -> Array2<f64> {
    let (s, d, t) = x.dim();
    Array2::from_shape_fn((s * t, d), |(row, di)| x[[row / t, di, row % t]])
}

/// Inverse of [`collapse`] for `n_samples` samples.
///
/// # Errors
/// `ShapeMismatch` when the row count is not a multiple of `n_samples`.
pub fn uncollapse(x: &Array2<f64>, n_samples: usize) -> EsinetResult<Array3<f64>> {
    let (rows, d) = x.dim();
    if n_samples == 0 || rows % n_samples != 0 {
        return Err(EsinetError::ShapeMismatch(format!(
            "{rows} rows cannot be split into {n_samples} samples"
        )));
    }
    let t = rows / n_samples;
    Ok(Array3::from_shape_fn((n_samples, d, t), |(s, di, ti)| {
        x[[s * t + ti, di]]
    }))
}
