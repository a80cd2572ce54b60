//! Sensor- and source-space data containers.
//!
//! - [`Info`] — channel metadata and sampling rate
//! - [`Raw`], [`Epochs`], [`Evoked`] — continuous, per-trial and averaged sensor data
//! - [`SensorData`] — tagged variant over the three containers
//! - [`SourceEstimate`] — per-dipole activity over time

mod sensor;
mod source;

pub use sensor::{Epochs, Evoked, Raw, SensorData};
pub use source::{SimulationInfo, SourceEstimate};

use serde::{Deserialize, Serialize};

/// Tolerance used when matching sample times against window bounds.
pub(crate) const TIME_TOLERANCE: f64 = 1e-9;

/// Sensor channel kind.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    /// Scalp electrode
    Eeg,
    /// Magnetometer
    Mag,
    /// Planar gradiometer
    Grad,
}

/// Channel metadata shared by all sensor containers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Info {
    /// Channel names, in data row order
    pub ch_names: Vec<String>,
    /// Channel kinds, parallel to `ch_names`
    pub ch_types: Vec<ChannelType>,
    /// Sampling frequency in Hz
    pub sfreq: f64,
    /// Whether a non-average reference has been applied
    #[serde(default)]
    pub custom_ref_applied: bool,
}

impl Info {
    /// Create an info block where every channel is EEG.
    pub fn eeg(ch_names: Vec<String>, sfreq: f64) -> Self {
        let ch_types = vec![ChannelType::Eeg; ch_names.len()];
        Self {
            ch_names,
            ch_types,
            sfreq,
            custom_ref_applied: false,
        }
    }

    /// Number of channels.
    pub fn n_channels(&self) -> usize {
        self.ch_names.len()
    }

    /// Whether any channel is an EEG electrode.
    pub fn has_eeg(&self) -> bool {
        self.ch_types.contains(&ChannelType::Eeg)
    }

    /// Row indices of EEG channels.
    pub fn eeg_indices(&self) -> Vec<usize> {
        self.ch_types
            .iter()
            .enumerate()
            .filter(|(_, t)| **t == ChannelType::Eeg)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Sample times for `n` samples starting at `tmin`.
pub(crate) fn sample_times(tmin: f64, sfreq: f64, n: usize) -> Vec<f64> {
    (0..n).map(|i| tmin + i as f64 / sfreq).collect()
}

/// Index range of samples whose time lies inside `[tmin, tmax]` (bounds inclusive,
/// `None` leaves that side open).
pub(crate) fn crop_range(
    times: &[f64],
    tmin: Option<f64>,
    tmax: Option<f64>,
) -> std::ops::Range<usize> {
    let start = match tmin {
        Some(t) => times
            .iter()
            .position(|&x| x >= t - TIME_TOLERANCE)
            .unwrap_or(times.len()),
        None => 0,
    };
    let end = match tmax {
        Some(t) => times
            .iter()
            .rposition(|&x| x <= t + TIME_TOLERANCE)
            .map_or(0, |i| i + 1),
        None => times.len(),
    };
    start..end.max(start)
}
