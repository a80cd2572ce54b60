//! Continuous, per-trial and averaged sensor recordings.
//!
//! Every container checks its channel axis against [`Info`] when built, also
//! when it is deserialized.

use ndarray::{s, Array2, Array3, ArrayView2, ArrayViewMut2, Axis};
use serde::{Deserialize, Serialize};

use super::{crop_range, sample_times, Info};
use crate::error::{EsinetError, EsinetResult};

/// Subtract the mean over EEG rows from every EEG row, per time sample.
fn apply_average_reference(mut data: ArrayViewMut2<'_, f64>, eeg_rows: &[usize]) {
    if eeg_rows.is_empty() {
        return;
    }
    let n = eeg_rows.len() as f64;
    for mut column in data.columns_mut() {
        let mean = eeg_rows.iter().map(|&r| column[r]).sum::<f64>() / n;
        for &r in eeg_rows {
            column[r] -= mean;
        }
    }
}

fn check_channels(info: &Info, got: usize) -> EsinetResult<()> {
    if info.ch_types.len() != info.n_channels() {
        return Err(EsinetError::ShapeMismatch(format!(
            "{} channel types for {} channel names",
            info.ch_types.len(),
            info.n_channels()
        )));
    }
    if !(info.sfreq.is_finite() && info.sfreq > 0.0) {
        return Err(EsinetError::InvalidConfig(format!(
            "sampling frequency must be > 0, got {}",
            info.sfreq
        )));
    }
    if got != info.n_channels() {
        return Err(EsinetError::ShapeMismatch(format!(
            "channel axis: expected {}, got {}",
            info.n_channels(),
            got
        )));
    }
    Ok(())
}

#[derive(Deserialize)]
struct RawRepr {
    info: Info,
    data: Array2<f64>,
    first_time: f64,
}

impl TryFrom<RawRepr> for Raw {
    type Error = EsinetError;

    fn try_from(r: RawRepr) -> EsinetResult<Self> {
        Raw::new(r.info, r.data, r.first_time)
    }
}

/// Continuous recording: channels × times.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "RawRepr")]
pub struct Raw {
    /// Channel metadata, one entry per data row
    pub info: Info,
    /// Channels × times
    pub data: Array2<f64>,
    /// Time of the first sample in seconds
    pub first_time: f64,
}

impl Raw {
    pub fn new(info: Info, data: Array2<f64>, first_time: f64) -> EsinetResult<Self> {
        check_channels(&info, data.nrows())?;
        Ok(Self {
            info,
            data,
            first_time,
        })
    }

    pub fn times(&self) -> Vec<f64> {
        sample_times(self.first_time, self.info.sfreq, self.data.ncols())
    }
}

#[derive(Deserialize)]
struct EpochsRepr {
    info: Info,
    data: Array3<f64>,
    tmin: f64,
}

impl TryFrom<EpochsRepr> for Epochs {
    type Error = EsinetError;

    fn try_from(r: EpochsRepr) -> EsinetResult<Self> {
        Epochs::new(r.info, r.data, r.tmin)
    }
}

/// Per-trial recording: trials × channels × times.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "EpochsRepr")]
pub struct Epochs {
    /// Channel metadata, one entry per channel row
    pub info: Info,
    /// Trials × channels × times
    pub data: Array3<f64>,
    /// Time of the first sample of every trial in seconds
    pub tmin: f64,
}

impl Epochs {
    /// Build epochs from a trials × channels × times array.
    ///
    /// # Errors
    /// `ShapeMismatch` when the channel axis does not match `info`.
    pub fn new(info: Info, data: Array3<f64>, tmin: f64) -> EsinetResult<Self> {
        check_channels(&info, data.dim().1)?;
        Ok(Self { info, data, tmin })
    }

    /// Build a single-trial epochs container from a channels × times array.
    pub fn single(info: Info, trial: Array2<f64>, tmin: f64) -> EsinetResult<Self> {
        let data = trial.insert_axis(Axis(0));
        Self::new(info, data, tmin)
    }

    pub fn n_trials(&self) -> usize {
        self.data.dim().0
    }

    pub fn n_times(&self) -> usize {
        self.data.dim().2
    }

    pub fn times(&self) -> Vec<f64> {
        sample_times(self.tmin, self.info.sfreq, self.n_times())
    }

    /// Channels × times view of trial `i`.
    pub fn trial(&self, i: usize) -> ArrayView2<'_, f64> {
        self.data.index_axis(Axis(0), i)
    }

    /// Average over trials.
    pub fn average(&self) -> Evoked {
        let data = self
            .data
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array2::zeros((self.info.n_channels(), self.n_times())));
        Evoked {
            info: self.info.clone(),
            data,
            tmin: self.tmin,
            nave: self.n_trials(),
        }
    }

    /// Keep samples with `tmin <= t <= tmax`.
    pub fn crop(&self, tmin: Option<f64>, tmax: Option<f64>) -> Epochs {
        let times = self.times();
        let range = crop_range(&times, tmin, tmax);
        let new_tmin = times.get(range.start).copied().unwrap_or(self.tmin);
        Epochs {
            info: self.info.clone(),
            data: self.data.slice(s![.., .., range]).to_owned(),
            tmin: new_tmin,
        }
    }

    /// Re-reference EEG channels of every trial to their common average.
    pub fn set_average_reference(&mut self) {
        let eeg_rows = self.info.eeg_indices();
        for trial in self.data.axis_iter_mut(Axis(0)) {
            apply_average_reference(trial, &eeg_rows);
        }
        self.info.custom_ref_applied = false;
    }
}

fn one() -> usize {
    1
}

#[derive(Deserialize)]
struct EvokedRepr {
    info: Info,
    data: Array2<f64>,
    tmin: f64,
    #[serde(default = "one")]
    nave: usize,
}

impl TryFrom<EvokedRepr> for Evoked {
    type Error = EsinetError;

    fn try_from(r: EvokedRepr) -> EsinetResult<Self> {
        let mut evoked = Evoked::new(r.info, r.data, r.tmin)?;
        evoked.nave = r.nave;
        Ok(evoked)
    }
}

/// Averaged response: channels × times.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "EvokedRepr")]
pub struct Evoked {
    /// Channel metadata, one entry per data row
    pub info: Info,
    /// Channels × times
    pub data: Array2<f64>,
    /// Time of the first sample in seconds
    pub tmin: f64,
    /// Number of averaged trials
    pub nave: usize,
}

impl Evoked {
    pub fn new(info: Info, data: Array2<f64>, tmin: f64) -> EsinetResult<Self> {
        check_channels(&info, data.nrows())?;
        Ok(Self {
            info,
            data,
            tmin,
            nave: 1,
        })
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    pub fn times(&self) -> Vec<f64> {
        sample_times(self.tmin, self.info.sfreq, self.n_times())
    }

    /// Keep samples with `tmin <= t <= tmax`.
    pub fn crop(&self, tmin: Option<f64>, tmax: Option<f64>) -> Evoked {
        let times = self.times();
        let range = crop_range(&times, tmin, tmax);
        let new_tmin = times.get(range.start).copied().unwrap_or(self.tmin);
        Evoked {
            info: self.info.clone(),
            data: self.data.slice(s![.., range]).to_owned(),
            tmin: new_tmin,
            nave: self.nave,
        }
    }

    /// Re-reference EEG channels to their common average.
    pub fn set_average_reference(&mut self) {
        let eeg_rows = self.info.eeg_indices();
        apply_average_reference(self.data.view_mut(), &eeg_rows);
        self.info.custom_ref_applied = false;
    }
}

/// Any sensor-space container.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SensorData {
    Raw(Raw),
    Epochs(Epochs),
    Evoked(Evoked),
}

impl SensorData {
    /// Variant name, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            SensorData::Raw(_) => "Raw",
            SensorData::Epochs(_) => "Epochs",
            SensorData::Evoked(_) => "Evoked",
        }
    }

    pub fn info(&self) -> &Info {
        match self {
            SensorData::Raw(r) => &r.info,
            SensorData::Epochs(e) => &e.info,
            SensorData::Evoked(e) => &e.info,
        }
    }

    /// Averaged form of the data.
    ///
    /// # Errors
    /// `UnsupportedContainer` for continuous recordings.
    pub fn to_evoked(&self) -> EsinetResult<Evoked> {
        match self {
            SensorData::Epochs(e) => Ok(e.average()),
            SensorData::Evoked(e) => Ok(e.clone()),
            SensorData::Raw(_) => Err(EsinetError::UnsupportedContainer {
                expected: "Evoked or Epochs",
                got: self.kind(),
            }),
        }
    }

    /// Every trial as a channels × times array with its start time.
    ///
    /// Evoked data counts as one trial; raw data is rejected.
    pub fn trials(&self) -> EsinetResult<Vec<(Array2<f64>, f64)>> {
        match self {
            SensorData::Epochs(e) => Ok((0..e.n_trials())
                .map(|i| (e.trial(i).to_owned(), e.tmin))
                .collect()),
            SensorData::Evoked(e) => Ok(vec![(e.data.clone(), e.tmin)]),
            SensorData::Raw(_) => Err(EsinetError::UnsupportedContainer {
                expected: "Evoked or Epochs",
                got: self.kind(),
            }),
        }
    }
}

impl From<Raw> for SensorData {
    fn from(r: Raw) -> Self {
        SensorData::Raw(r)
    }
}

impl From<Epochs> for SensorData {
    fn from(e: Epochs) -> Self {
        SensorData::Epochs(e)
    }
}

impl From<Evoked> for SensorData {
    fn from(e: Evoked) -> Self {
        SensorData::Evoked(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn info3() -> Info {
        Info::eeg(vec!["Fz".into(), "Cz".into(), "Pz".into()], 10.0)
    }

    #[test]
    fn test_epochs_average() {
        let data = Array3::from_shape_fn((2, 3, 4), |(t, _, _)| t as f64);
        let epochs = Epochs::new(info3(), data, 0.0).expect("epochs");
        let evoked = epochs.average();
        assert_eq!(evoked.nave, 2);
        assert_abs_diff_eq!(evoked.data[[1, 2]], 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_channel_mismatch_rejected() {
        let data = Array3::zeros((1, 2, 4));
        assert!(Epochs::new(info3(), data, 0.0).is_err());
    }

    #[test]
    fn test_average_reference_zero_mean() {
        let mut evoked = Evoked::new(info3(), array![[1.0, 2.0], [3.0, 0.0], [5.0, 1.0]], 0.0)
            .expect("evoked");
        evoked.set_average_reference();
        for column in evoked.data.columns() {
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_crop_updates_tmin() {
        let evoked = Evoked::new(info3(), Array2::zeros((3, 6)), -0.2).expect("evoked");
        let cropped = evoked.crop(Some(0.0), None);
        assert_eq!(cropped.n_times(), 4);
        assert_abs_diff_eq!(cropped.tmin, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_deserialize_checks_channels() {
        let ok = r#"{"kind": "evoked", "info": {"ch_names": ["Fz", "Cz"], "ch_types": ["eeg", "eeg"], "sfreq": 10.0},
                     "data": {"v": 1, "dim": [2, 3], "data": [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]}, "tmin": 0.0}"#;
        let data: SensorData = serde_json::from_str(ok).expect("valid evoked");
        assert_eq!(data.to_evoked().expect("evoked").nave, 1);

        let rows = r#"{"kind": "evoked", "info": {"ch_names": ["Fz", "Cz", "Pz"], "ch_types": ["eeg", "eeg", "eeg"], "sfreq": 10.0},
                       "data": {"v": 1, "dim": [2, 3], "data": [0.0, 1.0, 2.0, 3.0, 4.0, 5.0]}, "tmin": 0.0}"#;
        assert!(serde_json::from_str::<SensorData>(rows).is_err());

        let types = r#"{"kind": "epochs", "info": {"ch_names": ["Fz", "Cz"], "ch_types": ["eeg"], "sfreq": 10.0},
                        "data": {"v": 1, "dim": [1, 2, 1], "data": [0.0, 1.0]}, "tmin": 0.0}"#;
        assert!(serde_json::from_str::<SensorData>(types).is_err());
    }

    #[test]
    fn test_serialized_epochs_round_trip() {
        let epochs = Epochs::new(info3(), Array3::from_elem((2, 3, 4), 1.5), -0.1).expect("epochs");
        let text = serde_json::to_string(&SensorData::from(epochs)).expect("serialize");
        let back: SensorData = serde_json::from_str(&text).expect("deserialize");
        assert_eq!(back.trials().expect("trials").len(), 2);
    }

    #[test]
    fn test_raw_to_evoked_rejected() {
        let raw = Raw::new(info3(), Array2::zeros((3, 5)), 0.0).expect("raw");
        let data = SensorData::from(raw);
        match data.to_evoked() {
            Err(EsinetError::UnsupportedContainer { got, .. }) => assert_eq!(got, "Raw"),
            other => panic!("expected UnsupportedContainer, got {other:?}"),
        }
    }
}
