use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{EsinetError, EsinetResult};

/// Spatial profile of a simulated source region.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceShape {
    /// Equal amplitude for every member of the region
    Flat,
    /// Amplitude falls off with distance from the seed
    Gaussian,
    /// Pick flat or gaussian at random per source
    Both,
}

impl SourceShape {
    /// Resolve `Both` to one of the concrete shapes.
    pub fn pick<R: Rng + ?Sized>(self, rng: &mut R) -> SourceShape {
        match self {
            SourceShape::Both => {
                if rng.gen_bool(0.5) {
                    SourceShape::Flat
                } else {
                    SourceShape::Gaussian
                }
            }
            shape => shape,
        }
    }
}

/// Trial length in seconds: fixed, or drawn uniformly per sample.
///
/// Serialized as a bare number or a `[lo, hi]` pair.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationOfTrial {
    Fixed(f64),
    Range(f64, f64),
}

impl Default for DurationOfTrial {
    fn default() -> Self {
        DurationOfTrial::Fixed(0.0)
    }
}

impl DurationOfTrial {
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> f64 {
        match *self {
            DurationOfTrial::Fixed(d) => d,
            DurationOfTrial::Range(lo, hi) if lo < hi => rng.gen_range(lo..=hi),
            DurationOfTrial::Range(lo, _) => lo,
        }
    }

    /// Longest trial this setting can produce.
    pub fn max_seconds(&self) -> f64 {
        match *self {
            DurationOfTrial::Fixed(d) => d,
            DurationOfTrial::Range(lo, hi) => lo.max(hi),
        }
    }
}

/// Parameters of the random source model. Ranges are inclusive `(lo, hi)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    pub number_of_sources: (usize, usize),
    /// Region-growing order around each seed
    pub extents: (usize, usize),
    /// Source amplitude in nAm
    pub amplitudes: (f64, f64),
    pub shapes: SourceShape,
    pub duration_of_trial: DurationOfTrial,
    pub target_snr: (f64, f64),
    /// Spectral exponent of the 1/f time courses
    pub beta: (f64, f64),
    /// Base seed; sample `i` uses `seed + i`
    pub seed: Option<u64>,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            number_of_sources: (1, 5),
            extents: (0, 2),
            amplitudes: (1.0, 10.0),
            shapes: SourceShape::Both,
            duration_of_trial: DurationOfTrial::default(),
            target_snr: (2.0, 20.0),
            beta: (0.5, 1.5),
            seed: None,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Debug>(name: &str, range: (T, T)) -> EsinetResult<()> {
    if range.0 > range.1 {
        return Err(EsinetError::InvalidConfig(format!(
            "{name}: lower bound {:?} exceeds upper bound {:?}",
            range.0, range.1
        )));
    }
    Ok(())
}

impl SimulationSettings {
    /// Settings with every range collapsed onto the given SNR.
    pub fn with_snr(mut self, snr: f64) -> Self {
        self.target_snr = (snr, snr);
        self
    }

    pub fn validate(&self) -> EsinetResult<()> {
        check_range("number_of_sources", self.number_of_sources)?;
        check_range("extents", self.extents)?;
        check_range("amplitudes", self.amplitudes)?;
        check_range("target_snr", self.target_snr)?;
        check_range("beta", self.beta)?;
        if self.number_of_sources.0 == 0 {
            return Err(EsinetError::InvalidConfig(
                "number_of_sources must be at least 1".into(),
            ));
        }
        if self.target_snr.0 <= 0.0 {
            return Err(EsinetError::InvalidConfig(format!(
                "target_snr must be > 0, got {:?}",
                self.target_snr
            )));
        }
        match self.duration_of_trial {
            DurationOfTrial::Fixed(d) if d < 0.0 => Err(EsinetError::InvalidConfig(format!(
                "duration_of_trial must be >= 0, got {d}"
            ))),
            DurationOfTrial::Range(lo, hi) if lo < 0.0 || lo > hi => {
                Err(EsinetError::InvalidConfig(format!(
                    "duration_of_trial range ({lo}, {hi}) is invalid"
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_serde_forms() {
        let fixed: DurationOfTrial = serde_json::from_str("0.5").expect("fixed");
        assert_eq!(fixed, DurationOfTrial::Fixed(0.5));
        let range: DurationOfTrial = serde_json::from_str("[0.0, 0.1]").expect("range");
        assert_eq!(range, DurationOfTrial::Range(0.0, 0.1));
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let s: SimulationSettings =
            serde_json::from_str(r#"{"number_of_sources": [2, 2], "shapes": "flat"}"#).expect("settings");
        assert_eq!(s.number_of_sources, (2, 2));
        assert_eq!(s.shapes, SourceShape::Flat);
        assert_eq!(s.extents, SimulationSettings::default().extents);
    }

    #[test]
    fn test_validate_rejects_inverted_ranges() {
        let s = SimulationSettings {
            extents: (3, 1),
            ..SimulationSettings::default()
        };
        assert!(s.validate().is_err());
        let s = SimulationSettings {
            duration_of_trial: DurationOfTrial::Fixed(-1.0),
            ..SimulationSettings::default()
        };
        assert!(s.validate().is_err());
        assert!(SimulationSettings::default().validate().is_ok());
    }
}
