//! Signal-to-noise estimation and noise synthesis.

use ndarray::{concatenate, s, Array2, ArrayD, Axis, Dimension, IxDyn};
use ndarray_rand::RandomExt;
use rand::distributions::Uniform;
use rand::Rng;
use rustfft::num_complex::Complex;
use rustfft::{FftDirection, FftPlanner};

use crate::data::{Epochs, SensorData, SourceEstimate};
use crate::error::{EsinetError, EsinetResult};
use crate::forward::{unpack_fwd, ForwardModel};

/// Highest dimensionality supported by [`create_n_dim_noise`].
pub const MAX_NOISE_DIMS: usize = 4;

/// Signal-to-noise ratio of an averaged response.
///
/// Epochs are averaged first. At every time point the standard deviation across
/// channels is taken; the SNR is the maximum of that curve inside `data_span`
/// divided by its mean inside `baseline_span` (both bounds inclusive, seconds).
///
/// # Errors
/// - `UnsupportedContainer` for continuous data
/// - `DegenerateBaseline` when the baseline window is empty or flat
/// - `InvalidConfig` when the signal window is empty
pub fn calc_snr_range(
    data: &SensorData,
    baseline_span: (f64, f64),
    data_span: (f64, f64),
) -> EsinetResult<f64> {
    let evoked = data.to_evoked()?;

    let base = evoked.crop(Some(baseline_span.0), Some(baseline_span.1)).data;
    if base.ncols() == 0 {
        return Err(EsinetError::DegenerateBaseline(baseline_span));
    }
    let sd_base = base
        .std_axis(Axis(0), 0.0)
        .mean()
        .ok_or(EsinetError::DegenerateBaseline(baseline_span))?;
    if !(sd_base.is_finite() && sd_base > 0.0) {
        return Err(EsinetError::DegenerateBaseline(baseline_span));
    }

    let signal = evoked.crop(Some(data_span.0), Some(data_span.1)).data;
    if signal.ncols() == 0 {
        return Err(EsinetError::InvalidConfig(format!(
            "signal window {data_span:?} contains no samples"
        )));
    }
    let sd_signal = signal
        .std_axis(Axis(0), 0.0)
        .fold(f64::NEG_INFINITY, |m, &v| m.max(v));

    Ok(sd_signal / sd_base)
}

/// Transform `data` in place along every axis.
fn fft_all_axes(data: &mut ArrayD<Complex<f64>>, direction: FftDirection) {
    let mut planner = FftPlanner::new();
    for axis in 0..data.ndim() {
        let len = data.len_of(Axis(axis));
        let fft = planner.plan_fft(len, direction);
        let mut buffer = vec![Complex::new(0.0, 0.0); len];
        for mut lane in data.lanes_mut(Axis(axis)) {
            for (b, v) in buffer.iter_mut().zip(lane.iter()) {
                *b = *v;
            }
            fft.process(&mut buffer);
            for (v, b) in lane.iter_mut().zip(buffer.iter()) {
                *v = *b;
            }
        }
    }
}

/// Colored noise of the given shape (1 to 4 dimensions).
///
/// Uniform noise in [-1, 1) is transformed to the frequency domain, scaled by
/// `1 / shape[0]`, divided by `sum_k f_k^exponent` with `f_k = sqrt(i_k + 1)` the
/// frequency index along axis `k`, and transformed back. The real part is
/// returned. `exponent = 2` approximates pink noise.
///
/// # Errors
/// `UnsupportedDimensionality` for zero or more than [`MAX_NOISE_DIMS`] axes.
pub fn create_n_dim_noise<R: Rng + ?Sized>(
    shape: &[usize],
    exponent: f64,
    rng: &mut R,
) -> EsinetResult<ArrayD<f64>> {
    if shape.is_empty() || shape.len() > MAX_NOISE_DIMS {
        return Err(EsinetError::UnsupportedDimensionality(shape.len()));
    }
    if shape.contains(&0) {
        return Ok(ArrayD::zeros(IxDyn(shape)));
    }

    let signal = ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0, 1.0), rng);
    let mut spectrum = signal.mapv(|v| Complex::new(v, 0.0));
    fft_all_axes(&mut spectrum, FftDirection::Forward);

    let leading = shape[0] as f64;
    for (idx, value) in spectrum.indexed_iter_mut() {
        let attenuation: f64 = idx
            .slice()
            .iter()
            .map(|&i| ((i + 1) as f64).sqrt().powf(exponent))
            .sum();
        *value /= leading * attenuation;
    }

    fft_all_axes(&mut spectrum, FftDirection::Inverse);
    let total = spectrum.len() as f64;
    Ok(spectrum.mapv(|c| c.re / total))
}

/// Prepend `num` samples of measurement noise to a single-trial recording.
///
/// The noise is the residual between the recording and the leadfield projection
/// of its true sources. When the residual is not longer than `num` it is tiled;
/// a random contiguous window of `num` samples is then prepended and `tmin` moves
/// back by `num / sfreq`.
///
/// # Errors
/// `ShapeMismatch` when the trial, the sources and the leadfield disagree.
pub fn add_noise_baseline<R: Rng + ?Sized>(
    eeg: &Epochs,
    src: &SourceEstimate,
    fwd: &ForwardModel,
    num: usize,
    rng: &mut R,
) -> EsinetResult<Epochs> {
    if eeg.n_trials() != 1 {
        return Err(EsinetError::ShapeMismatch(format!(
            "expected a single trial, got {}",
            eeg.n_trials()
        )));
    }
    let leadfield = unpack_fwd(fwd).leadfield;
    if leadfield.ncols() != src.n_dipoles() {
        return Err(EsinetError::ShapeMismatch(format!(
            "leadfield has {} dipoles, sources have {}",
            leadfield.ncols(),
            src.n_dipoles()
        )));
    }

    let noisy = eeg.trial(0).to_owned();
    let true_eeg = leadfield.dot(&src.data);
    if true_eeg.dim() != noisy.dim() {
        return Err(EsinetError::ShapeMismatch(format!(
            "projected sources {:?} vs recording {:?}",
            true_eeg.dim(),
            noisy.dim()
        )));
    }
    let mut noise: Array2<f64> = &noisy - &true_eeg;
    let len = noise.ncols();
    if len == 0 {
        return Err(EsinetError::ShapeMismatch("recording has no samples".into()));
    }

    if num >= len {
        let multiplier = num.div_ceil(len) + 1;
        let views: Vec<_> = (0..multiplier).map(|_| noise.view()).collect();
        noise = concatenate(Axis(1), &views)
            .map_err(|e| EsinetError::ShapeMismatch(e.to_string()))?;
    }

    let start = rng.gen_range(0..noise.ncols() - num);
    let piece = noise.slice(s![.., start..start + num]);
    let extended = concatenate(Axis(1), &[piece, noisy.view()])
        .map_err(|e| EsinetError::ShapeMismatch(e.to_string()))?;

    let tmin = eeg.tmin - num as f64 / eeg.info.sfreq;
    Epochs::single(eeg.info.clone(), extended, tmin)
}
