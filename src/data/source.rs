use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};

use super::{crop_range, sample_times};
use crate::error::{EsinetError, EsinetResult};

/// Ground truth describing how a simulated sample was built.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SimulationInfo {
    pub number_of_sources: usize,
    /// Seed dipole of every source
    pub positions: Vec<usize>,
    /// Region-growing order of every source
    pub extents: Vec<usize>,
    /// Peak amplitude of every source (nAm)
    pub amplitudes: Vec<f64>,
    /// Exponent of the 1/f time courses
    pub betas: Vec<f64>,
    /// SNR the sensor noise was scaled to
    pub target_snr: f64,
    pub duration_of_trial: f64,
}

/// Per-dipole activity over time.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceEstimate {
    /// Dipoles × times
    pub data: Array2<f64>,
    /// Used vertex numbers of the left and right hemisphere
    pub vertices: [Vec<usize>; 2],
    pub tmin: f64,
    /// Sampling interval in seconds
    pub tstep: f64,
    pub subject: String,
    #[serde(default)]
    pub simulation_info: Option<SimulationInfo>,
}

impl SourceEstimate {
    /// # Errors
    /// `ShapeMismatch` when the dipole axis does not match the vertex count.
    pub fn new(
        data: Array2<f64>,
        vertices: [Vec<usize>; 2],
        tmin: f64,
        tstep: f64,
        subject: impl Into<String>,
    ) -> EsinetResult<Self> {
        let n_dipoles = vertices[0].len() + vertices[1].len();
        if data.nrows() != n_dipoles {
            return Err(EsinetError::ShapeMismatch(format!(
                "dipole axis: expected {}, got {}",
                n_dipoles,
                data.nrows()
            )));
        }
        Ok(Self {
            data,
            vertices,
            tmin,
            tstep,
            subject: subject.into(),
            simulation_info: None,
        })
    }

    pub fn n_dipoles(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_times(&self) -> usize {
        self.data.ncols()
    }

    pub fn sfreq(&self) -> f64 {
        1.0 / self.tstep
    }

    pub fn times(&self) -> Vec<f64> {
        sample_times(self.tmin, self.sfreq(), self.n_times())
    }

    /// Copy with all-zero data of the given number of time samples.
    pub fn zeros_like(&self, n_times: usize) -> Self {
        Self {
            data: Array2::zeros((self.n_dipoles(), n_times)),
            vertices: self.vertices.clone(),
            tmin: self.tmin,
            tstep: self.tstep,
            subject: self.subject.clone(),
            simulation_info: None,
        }
    }

    /// Keep samples with `tmin <= t <= tmax`.
    pub fn crop(&self, tmin: Option<f64>, tmax: Option<f64>) -> Self {
        let times = self.times();
        let range = crop_range(&times, tmin, tmax);
        let new_tmin = times.get(range.start).copied().unwrap_or(self.tmin);
        Self {
            data: self.data.slice(s![.., range]).to_owned(),
            vertices: self.vertices.clone(),
            tmin: new_tmin,
            tstep: self.tstep,
            subject: self.subject.clone(),
            simulation_info: self.simulation_info.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dipole_axis_checked() {
        let vertices = [vec![0, 1], vec![0]];
        assert!(SourceEstimate::new(Array2::zeros((3, 4)), vertices.clone(), 0.0, 0.01, "fsaverage").is_ok());
        assert!(SourceEstimate::new(Array2::zeros((4, 3)), vertices, 0.0, 0.01, "fsaverage").is_err());
    }

    #[test]
    fn test_zeros_like() {
        let stc = SourceEstimate::new(Array2::ones((3, 4)), [vec![0, 1], vec![0]], 0.0, 0.01, "fsaverage")
            .expect("stc");
        let zeros = stc.zeros_like(7);
        assert_eq!(zeros.data.dim(), (3, 7));
        assert!(zeros.data.iter().all(|&v| v == 0.0));
    }
}
