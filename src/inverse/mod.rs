//! Classical inverse solutions: the minimum-norm family and the LCMV
//! beamformer, applied to single recordings or whole simulations.

pub mod covariance;
pub mod solvers;

pub use covariance::Covariance;
pub use solvers::{lcmv_filter, minimum_norm_kernel};

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::data::{Epochs, SensorData, SourceEstimate};
use crate::error::{EsinetError, EsinetResult, SolverError};
use crate::forward::ForwardModel;
use crate::noise::add_noise_baseline;
use crate::simulation::Simulation;
use covariance::{average_reference_projector, AD_HOC_EEG_STD};

/// Batches smaller than this always run sequentially.
pub const MIN_PARALLEL_SAMPLES: usize = 4;

/// Classical inverse solver.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InverseMethod {
    Mne,
    Dspm,
    SLoreta,
    ELoreta,
    /// Linearly constrained minimum variance beamformer
    Lcmv,
}

impl InverseMethod {
    pub fn name(self) -> &'static str {
        match self {
            InverseMethod::Mne => "MNE",
            InverseMethod::Dspm => "dSPM",
            InverseMethod::SLoreta => "sLORETA",
            InverseMethod::ELoreta => "eLORETA",
            InverseMethod::Lcmv => "LCMV",
        }
    }
}

impl fmt::Display for InverseMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for InverseMethod {
    type Err = EsinetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mne" => Ok(InverseMethod::Mne),
            "dspm" => Ok(InverseMethod::Dspm),
            "sloreta" => Ok(InverseMethod::SLoreta),
            "eloreta" => Ok(InverseMethod::ELoreta),
            "lcmv" | "beamformer" | "beamforming" => Ok(InverseMethod::Lcmv),
            _ => Err(EsinetError::UnknownMethod(s.to_string())),
        }
    }
}

/// Normalization of beamformer weights.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeightNorm {
    UnitNoiseGain,
}

impl FromStr for WeightNorm {
    type Err = EsinetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unit-noise-gain" => Ok(WeightNorm::UnitNoiseGain),
            _ => Err(EsinetError::InvalidConfig(format!("unknown weight normalization {s:?}"))),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InverseParams {
    pub method: InverseMethod,
    /// Assumed SNR of the data; the regularization is `1 / snr²`
    pub snr: f64,
    /// Noise covariance window in seconds; both `None` means no baseline
    pub baseline: (Option<f64>, Option<f64>),
    /// Beamformer regularization and covariance loading factor
    pub reg: f64,
    /// Diagonal loading of the estimated covariances
    pub regularize: bool,
    pub weight_norm: Option<WeightNorm>,
}

impl Default for InverseParams {
    fn default() -> Self {
        Self {
            method: InverseMethod::ELoreta,
            snr: 3.0,
            baseline: (None, None),
            reg: 0.05,
            regularize: false,
            weight_norm: None,
        }
    }
}

impl InverseParams {
    pub fn has_baseline(&self) -> bool {
        self.baseline.0.is_some() || self.baseline.1.is_some()
    }
}

/// What to do with a trial whose solver fails numerically.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Substitute an all-zero estimate and log a warning
    #[default]
    ZeroFill,
    /// Return the first failure
    Abort,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchOptions {
    pub parallel: bool,
    /// Prepend a noise baseline to every trial and use it for the noise covariance
    pub add_baseline: bool,
    pub n_baseline: usize,
    pub on_failure: FailurePolicy,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            parallel: true,
            add_baseline: false,
            n_baseline: 200,
            on_failure: FailurePolicy::ZeroFill,
        }
    }
}

/// Inverse solution of one recording.
///
/// Epochs are averaged and EEG channels are re-referenced to the common
/// average (the leadfield and covariances are projected accordingly). The noise
/// covariance comes from the baseline window when one is set; the minimum-norm
/// methods fall back to an ad-hoc diagonal covariance otherwise. The estimate
/// covers the samples at `t >= 0`.
///
/// # Errors
/// - `UnsupportedContainer` for continuous data
/// - `ShapeMismatch` when the data names channels the forward model lacks
/// - `Solver` for numerical failures and empty windows
pub fn mne_inverse(
    fwd: &ForwardModel,
    data: &SensorData,
    params: &InverseParams,
) -> EsinetResult<SourceEstimate> {
    if !(params.snr.is_finite() && params.snr > 0.0) {
        return Err(EsinetError::InvalidConfig(format!(
            "snr must be > 0, got {}",
            params.snr
        )));
    }

    let mut evoked = data.to_evoked()?;
    let info = evoked.info.clone();
    let sfreq = info.sfreq;
    let eeg = info.has_eeg();
    if eeg {
        evoked.set_average_reference();
    }
    let project = |cov: Covariance| {
        if eeg {
            cov.average_referenced(&info)
        } else {
            cov
        }
    };

    let leadfield = average_reference_projector(&info).dot(&fwd.to_fixed().pick_channels(&info.ch_names)?);
    let trials = data.trials()?;

    let (bmin, bmax) = params.baseline;
    let mut noise_cov = if params.has_baseline() {
        Some(project(Covariance::empirical(&trials, sfreq, bmin, bmax)?))
    } else {
        None
    };
    if params.regularize {
        noise_cov = noise_cov.map(|c| c.regularized(params.reg));
    }

    let post = evoked.crop(Some(0.0), None);
    if post.n_times() == 0 {
        return Err(SolverError::EmptyWindow {
            tmin: Some(0.0),
            tmax: None,
        }
        .into());
    }

    let kernel = match params.method {
        InverseMethod::Lcmv => {
            let mut data_cov = project(Covariance::empirical(&trials, sfreq, bmax, None)?);
            if params.regularize {
                data_cov = data_cov.regularized(params.reg);
            }
            lcmv_filter(
                &leadfield,
                &data_cov,
                noise_cov.as_ref(),
                params.reg,
                params.weight_norm == Some(WeightNorm::UnitNoiseGain),
            )?
        }
        method => {
            let cov = noise_cov
                .unwrap_or_else(|| project(Covariance::ad_hoc(info.n_channels(), AD_HOC_EEG_STD)));
            minimum_norm_kernel(&leadfield, &cov, 1.0 / (params.snr * params.snr), method)?
        }
    };
    debug!(method = %params.method, n_times = post.n_times(), "applying inverse kernel");

    SourceEstimate::new(
        kernel.dot(&post.data),
        fwd.vertices(),
        post.tmin,
        1.0 / sfreq,
        fwd.subject(),
    )
}

/// [`mne_inverse`] for every trial of a simulation, in trial order.
///
/// With `add_baseline`, `n_baseline` samples of the simulated noise are
/// prepended to every trial and `(tmin, 0)` becomes the baseline window. Trials
/// whose solver fails are handled according to `on_failure`, identically on the
/// sequential and the parallel path; other errors always abort.
pub fn wrap_mne_inverse(
    fwd: &ForwardModel,
    sim: &Simulation,
    params: &InverseParams,
    options: &BatchOptions,
) -> EsinetResult<Vec<SourceEstimate>> {
    let n_samples = sim.n_samples();
    let mut params = params.clone();

    let eeg: Vec<Epochs> = if options.add_baseline {
        let base_seed = sim.settings.seed.unwrap_or_else(|| rand::thread_rng().gen());
        let extended = sim
            .eeg_data
            .iter()
            .zip(&sim.source_data)
            .enumerate()
            .map(|(i, (epochs, stc))| {
                let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(i as u64));
                add_noise_baseline(epochs, stc, fwd, options.n_baseline, &mut rng)
            })
            .collect::<EsinetResult<Vec<_>>>()?;
        if let Some(first) = extended.first() {
            params.baseline = (Some(first.tmin), Some(0.0));
        }
        extended
    } else {
        sim.eeg_data.clone()
    };

    let parallel = options.parallel && n_samples >= MIN_PARALLEL_SAMPLES;
    let solve = |(i, epochs): (usize, &Epochs)| -> EsinetResult<SourceEstimate> {
        match mne_inverse(fwd, &SensorData::from(epochs.clone()), &params) {
            Err(EsinetError::Solver(err)) if options.on_failure == FailurePolicy::ZeroFill => {
                warn!(trial = i, method = %params.method, error = %err, "inverse failed, returning zeros");
                zero_estimate(fwd, epochs)
            }
            other => other,
        }
    };

    if parallel {
        eeg.par_iter().enumerate().map(solve).collect()
    } else {
        eeg.iter().enumerate().map(solve).collect()
    }
}

/// All-zero estimate covering the samples of `epochs` at `t >= 0`.
fn zero_estimate(fwd: &ForwardModel, epochs: &Epochs) -> EsinetResult<SourceEstimate> {
    let post = epochs.crop(Some(0.0), None);
    SourceEstimate::new(
        Array2::zeros((fwd.n_sources(), post.n_times())),
        fwd.vertices(),
        post.tmin,
        1.0 / epochs.info.sfreq,
        fwd.subject(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Evoked, Info, Raw};
    use crate::forward::tests::tiny_forward;
    use crate::forward::Orientation;
    use crate::simulation::tests::tiny_simulation;
    use crate::simulation::DurationOfTrial;
    use ndarray::Array2;

    /// Evoked response of dipole 2 after 0.1 s of low-level noise.
    fn evoked(fwd: &ForwardModel) -> Evoked {
        let info = Info::eeg(fwd.ch_names.clone(), 100.0);
        let mut sources = Array2::zeros((8, 30));
        for t in 10..30 {
            sources[[2, t]] = 1.0;
        }
        let mut data = fwd.leadfield.dot(&sources);
        for ((c, t), v) in data.indexed_iter_mut() {
            *v += 0.05 * (((c * 31 + t * 17) % 11) as f64 - 5.0);
        }
        Evoked::new(info, data, -0.1).expect("evoked")
    }

    #[test]
    fn test_method_names() {
        assert_eq!("eLORETA".parse::<InverseMethod>().expect("parse"), InverseMethod::ELoreta);
        assert_eq!("dspm".parse::<InverseMethod>().expect("parse"), InverseMethod::Dspm);
        for alias in ["beamformer", "beamforming", "LCMV"] {
            assert_eq!(alias.parse::<InverseMethod>().expect("parse"), InverseMethod::Lcmv);
        }
        assert!(matches!(
            "music".parse::<InverseMethod>(),
            Err(EsinetError::UnknownMethod(_))
        ));
        assert_eq!(
            "unit-noise-gain".parse::<WeightNorm>().expect("parse"),
            WeightNorm::UnitNoiseGain
        );
        assert!(matches!(
            "unit-gain".parse::<WeightNorm>(),
            Err(EsinetError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_minimum_norm_methods_cover_post_stimulus() {
        let fwd = tiny_forward(Orientation::Fixed);
        let data = SensorData::from(evoked(&fwd));
        for method in [
            InverseMethod::Mne,
            InverseMethod::Dspm,
            InverseMethod::SLoreta,
            InverseMethod::ELoreta,
        ] {
            let params = InverseParams {
                method,
                ..InverseParams::default()
            };
            let stc = mne_inverse(&fwd, &data, &params).expect("inverse");
            assert_eq!(stc.data.dim(), (8, 20));
            assert!(stc.tmin.abs() < 1e-9);
            assert!(stc.data.iter().all(|v| v.is_finite()));
        }
    }

    #[test]
    fn test_baseline_noise_covariance() {
        let fwd = tiny_forward(Orientation::Free);
        let data = SensorData::from(evoked(&fwd.to_fixed()));
        let params = InverseParams {
            method: InverseMethod::Dspm,
            baseline: (Some(-0.1), Some(0.0)),
            regularize: true,
            ..InverseParams::default()
        };
        let stc = mne_inverse(&fwd, &data, &params).expect("inverse");
        assert_eq!(stc.n_dipoles(), 8);
    }

    #[test]
    fn test_lcmv() {
        let fwd = tiny_forward(Orientation::Fixed);
        let data = SensorData::from(evoked(&fwd));
        let params = InverseParams {
            method: InverseMethod::Lcmv,
            baseline: (Some(-0.1), Some(0.0)),
            weight_norm: Some(WeightNorm::UnitNoiseGain),
            regularize: true,
            ..InverseParams::default()
        };
        let stc = mne_inverse(&fwd, &data, &params).expect("lcmv");
        assert_eq!(stc.data.dim(), (8, 20));
    }

    #[test]
    fn test_raw_is_rejected() {
        let fwd = tiny_forward(Orientation::Fixed);
        let e = evoked(&fwd);
        let raw = Raw::new(e.info.clone(), e.data.clone(), 0.0).expect("raw");
        let err = mne_inverse(&fwd, &SensorData::from(raw), &InverseParams::default());
        assert!(matches!(err, Err(EsinetError::UnsupportedContainer { .. })));
    }

    #[test]
    fn test_batch_in_trial_order() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.1), 6, false);
        let params = InverseParams {
            method: InverseMethod::Mne,
            ..InverseParams::default()
        };
        let seq = wrap_mne_inverse(
            &sim.forward,
            &sim,
            &params,
            &BatchOptions {
                parallel: false,
                ..BatchOptions::default()
            },
        )
        .expect("sequential");
        let par = wrap_mne_inverse(&sim.forward, &sim, &params, &BatchOptions::default()).expect("parallel");
        assert_eq!(seq.len(), 6);
        for (a, b) in seq.iter().zip(&par) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn test_failure_policy() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.1), 5, false);
        // no samples before stimulus onset: the covariance window is empty
        let params = InverseParams {
            baseline: (Some(-1.0), Some(-0.5)),
            ..InverseParams::default()
        };
        for parallel in [false, true] {
            let options = BatchOptions {
                parallel,
                ..BatchOptions::default()
            };
            let stcs = wrap_mne_inverse(&sim.forward, &sim, &params, &options).expect("zero fill");
            assert_eq!(stcs.len(), 5);
            assert!(stcs.iter().all(|s| s.data.dim() == (8, 10) && s.data.iter().all(|&v| v == 0.0)));

            let abort = BatchOptions {
                on_failure: FailurePolicy::Abort,
                ..options
            };
            assert!(matches!(
                wrap_mne_inverse(&sim.forward, &sim, &params, &abort),
                Err(EsinetError::Solver(SolverError::EmptyWindow { .. }))
            ));
        }
    }

    #[test]
    fn test_added_baseline_is_dropped_from_estimate() {
        let sim = tiny_simulation(DurationOfTrial::Fixed(0.1), 3, false);
        let options = BatchOptions {
            add_baseline: true,
            n_baseline: 20,
            ..BatchOptions::default()
        };
        let params = InverseParams {
            method: InverseMethod::SLoreta,
            regularize: true,
            ..InverseParams::default()
        };
        let stcs = wrap_mne_inverse(&sim.forward, &sim, &params, &options).expect("inverse");
        assert!(stcs.iter().all(|s| s.n_times() == 10));
    }
}
