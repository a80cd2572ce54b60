//! Sensor covariance estimates used to whiten and regularize the solvers.

use ndarray::{s, Array2, Axis};

use crate::data::{crop_range, sample_times, Info};
use crate::error::SolverError;

/// Standard deviation of the ad-hoc EEG noise model, in data units.
pub const AD_HOC_EEG_STD: f64 = 1.0;

/// Channels × channels covariance with the number of samples it was built from.
#[derive(Clone, Debug, PartialEq)]
pub struct Covariance {
    pub data: Array2<f64>,
    pub nfree: usize,
}

impl Covariance {
    /// Diagonal covariance with `std²` on every channel.
    pub fn ad_hoc(n_channels: usize, std: f64) -> Self {
        Self {
            data: Array2::<f64>::eye(n_channels) * std * std,
            nfree: 1,
        }
    }

    /// Empirical covariance over `[tmin, tmax]` of every trial.
    ///
    /// Each trial is demeaned per channel inside the window before its outer
    /// product is accumulated; the sum is divided by the number of samples
    /// minus the number of trials.
    ///
    /// # Errors
    /// `EmptyWindow` when no trial has samples in the window.
    pub fn empirical(
        trials: &[(Array2<f64>, f64)],
        sfreq: f64,
        tmin: Option<f64>,
        tmax: Option<f64>,
    ) -> Result<Self, SolverError> {
        let n_channels = trials.first().map_or(0, |(t, _)| t.nrows());
        let mut acc = Array2::<f64>::zeros((n_channels, n_channels));
        let mut n_samples = 0usize;
        let mut n_used = 0usize;

        for (trial, trial_tmin) in trials {
            let times = sample_times(*trial_tmin, sfreq, trial.ncols());
            let range = crop_range(&times, tmin, tmax);
            if range.is_empty() {
                continue;
            }
            let window = trial.slice(s![.., range]);
            let Some(mean) = window.mean_axis(Axis(1)) else {
                continue;
            };
            let centered = &window - &mean.insert_axis(Axis(1));
            acc = acc + centered.dot(&centered.t());
            n_samples += centered.ncols();
            n_used += 1;
        }

        if n_used == 0 {
            return Err(SolverError::EmptyWindow { tmin, tmax });
        }
        let nfree = n_samples.saturating_sub(n_used).max(1);
        Ok(Self {
            data: acc / nfree as f64,
            nfree,
        })
    }

    /// Diagonal loading by `reg` times the mean channel variance.
    pub fn regularized(&self, reg: f64) -> Self {
        let n = self.data.nrows();
        let load = if n == 0 {
            0.0
        } else {
            reg * self.data.diag().sum() / n as f64
        };
        Self {
            data: &self.data + &(Array2::<f64>::eye(n) * load),
            nfree: self.nfree,
        }
    }

    /// Project onto the average-reference subspace of the EEG channels.
    pub fn average_referenced(&self, info: &Info) -> Self {
        let proj = average_reference_projector(info);
        Self {
            data: proj.dot(&self.data).dot(&proj.t()),
            nfree: self.nfree,
        }
    }
}

/// `I - 11ᵀ/n` restricted to the EEG channels of `info`; identity elsewhere.
pub fn average_reference_projector(info: &Info) -> Array2<f64> {
    let n = info.n_channels();
    let eeg = info.eeg_indices();
    let mut proj = Array2::<f64>::eye(n);
    if eeg.is_empty() {
        return proj;
    }
    let w = 1.0 / eeg.len() as f64;
    for &i in &eeg {
        for &j in &eeg {
            proj[[i, j]] -= w;
        }
    }
    proj
}
