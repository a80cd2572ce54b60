//! Synthetic EEG/source training pairs.
//!
//! Each sample places a random number of spatially extended sources on the
//! cortical mesh (region growing around a random seed), gives them 1/f time
//! courses, projects them through the leadfield and adds sensor noise at a
//! randomly drawn SNR.
//!
//! Samples are generated independently with one seeded RNG per sample, so a
//! fixed [`SimulationSettings::seed`] reproduces the same data with or without
//! the Rayon path.

mod settings;

pub use settings::{DurationOfTrial, SimulationSettings, SourceShape};

use ndarray::{Array1, Array2};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::data::{Epochs, Info, SimulationInfo, SourceEstimate};
use crate::error::{EsinetError, EsinetResult};
use crate::forward::ForwardModel;
use crate::mesh::{get_n_order_indices, get_neighbors};
use crate::noise::create_n_dim_noise;
use crate::utils::{gaussian, rms};

/// Dipole moments are drawn in nAm and stored in Am.
const NANO_AMPERE_METRE: f64 = 1e-9;

/// Paired sensor and source data for training.
#[derive(Clone, Debug)]
pub struct Simulation {
    pub forward: Arc<ForwardModel>,
    pub info: Info,
    pub settings: SimulationSettings,
    pub parallel: bool,
    /// Whether samples span more than one time point
    pub temporal: bool,
    /// One single-trial container per sample
    pub eeg_data: Vec<Epochs>,
    pub source_data: Vec<SourceEstimate>,
    pub simulation_info: Vec<SimulationInfo>,
}

/// Read-only inputs shared by every sample of one `simulate` call.
struct SampleContext<'a> {
    leadfield: Array2<f64>,
    neighbors: Vec<Vec<usize>>,
    pos: Array2<f64>,
    settings: &'a SimulationSettings,
    sfreq: f64,
}

struct Sample {
    eeg: Array2<f64>,
    sources: Array2<f64>,
    info: SimulationInfo,
}

impl Simulation {
    /// # Errors
    /// `InvalidConfig` for inconsistent settings, `ShapeMismatch` when `info`
    /// names channels the forward model lacks.
    pub fn new(
        forward: Arc<ForwardModel>,
        info: Info,
        settings: SimulationSettings,
        parallel: bool,
    ) -> EsinetResult<Self> {
        settings.validate()?;
        if info.sfreq <= 0.0 {
            return Err(EsinetError::InvalidConfig(format!(
                "sampling frequency must be > 0, got {}",
                info.sfreq
            )));
        }
        forward.pick_channels(&info.ch_names)?;
        let temporal = settings.duration_of_trial.max_seconds() > 0.0;
        Ok(Self {
            forward,
            info,
            settings,
            parallel,
            temporal,
            eeg_data: Vec::new(),
            source_data: Vec::new(),
            simulation_info: Vec::new(),
        })
    }

    pub fn n_samples(&self) -> usize {
        self.eeg_data.len()
    }

    /// Generate `n_samples` new samples, replacing any previous ones.
    pub fn simulate(&mut self, n_samples: usize) -> EsinetResult<()> {
        let start = Instant::now();
        let ctx = SampleContext {
            leadfield: self.forward.to_fixed().pick_channels(&self.info.ch_names)?,
            neighbors: get_neighbors(&self.forward)?,
            pos: self.forward.mni_positions(),
            settings: &self.settings,
            sfreq: self.info.sfreq,
        };
        let base_seed = self
            .settings
            .seed
            .unwrap_or_else(|| rand::thread_rng().gen());

        let run = |i: usize| {
            let mut rng = StdRng::seed_from_u64(base_seed.wrapping_add(i as u64));
            simulate_sample(&ctx, &mut rng)
        };
        let samples: Vec<Sample> = if self.parallel {
            (0..n_samples).into_par_iter().map(run).collect::<EsinetResult<_>>()?
        } else {
            (0..n_samples).map(run).collect::<EsinetResult<_>>()?
        };

        let vertices = self.forward.vertices();
        let subject = self.forward.subject().to_string();
        let mut eeg_data = Vec::with_capacity(n_samples);
        let mut source_data = Vec::with_capacity(n_samples);
        let mut simulation_info = Vec::with_capacity(n_samples);
        for sample in samples {
            let mut epochs = Epochs::single(self.info.clone(), sample.eeg, 0.0)?;
            if self.info.has_eeg() {
                epochs.set_average_reference();
            }
            let mut stc = SourceEstimate::new(
                sample.sources,
                vertices.clone(),
                0.0,
                1.0 / self.info.sfreq,
                subject.clone(),
            )?;
            stc.simulation_info = Some(sample.info.clone());
            eeg_data.push(epochs);
            source_data.push(stc);
            simulation_info.push(sample.info);
        }

        self.temporal = eeg_data.iter().any(|e| e.n_times() > 1);
        self.eeg_data = eeg_data;
        self.source_data = source_data;
        self.simulation_info = simulation_info;

        info!(
            n_samples,
            parallel = self.parallel,
            elapsed_secs = start.elapsed().as_secs_f32(),
            "simulation complete"
        );
        Ok(())
    }
}

fn simulate_sample(ctx: &SampleContext<'_>, rng: &mut StdRng) -> EsinetResult<Sample> {
    let settings = ctx.settings;
    let n_dipoles = ctx.leadfield.ncols();
    let duration = settings.duration_of_trial.sample(rng);
    let n_times = ((duration * ctx.sfreq).round() as usize).max(1);

    let n_sources = rng.gen_range(settings.number_of_sources.0..=settings.number_of_sources.1);
    let mut sources = Array2::zeros((n_dipoles, n_times));
    let mut info = SimulationInfo {
        number_of_sources: n_sources,
        duration_of_trial: duration,
        ..SimulationInfo::default()
    };

    for _ in 0..n_sources {
        let seed = rng.gen_range(0..n_dipoles);
        let order = rng.gen_range(settings.extents.0..=settings.extents.1);
        let amplitude = rng.gen_range(settings.amplitudes.0..=settings.amplitudes.1);
        let beta = rng.gen_range(settings.beta.0..=settings.beta.1);

        let region = get_n_order_indices(order, seed, &ctx.neighbors)?;
        let weights = spatial_weights(&region, seed, &ctx.pos, settings.shapes.pick(rng));
        let course = time_course(n_times, beta, rng)?;

        for (&dipole, &w) in region.iter().zip(weights.iter()) {
            let mut row = sources.row_mut(dipole);
            row.scaled_add(amplitude * NANO_AMPERE_METRE * w, &course);
        }

        info.positions.push(seed);
        info.extents.push(order);
        info.amplitudes.push(amplitude);
        info.betas.push(beta);
    }

    let clean = ctx.leadfield.dot(&sources);
    let target_snr = rng.gen_range(settings.target_snr.0..=settings.target_snr.1);
    info.target_snr = target_snr;

    let noise: Array2<f64> = Array2::random_using(clean.dim(), StandardNormal, rng);
    let signal_rms = rms(&clean);
    let noise_rms = rms(&noise);
    let eeg = if signal_rms > 0.0 && noise_rms > 0.0 {
        &clean + &(noise * (signal_rms / (target_snr * noise_rms)))
    } else {
        debug!("silent sample, no noise added");
        clean
    };

    Ok(Sample {
        eeg,
        sources,
        info,
    })
}

/// Per-member weights of a grown region: flat, or a Gaussian falloff with
/// distance from the seed whose width is half the region radius.
fn spatial_weights(region: &[usize], seed: usize, pos: &Array2<f64>, shape: SourceShape) -> Vec<f64> {
    match shape {
        SourceShape::Gaussian if region.len() > 1 => {
            let center = pos.row(seed);
            let dists: Vec<f64> = region
                .iter()
                .map(|&i| {
                    let d = &pos.row(i) - &center;
                    d.dot(&d).sqrt()
                })
                .collect();
            let radius = dists.iter().copied().fold(0.0, f64::max);
            if radius <= 0.0 {
                return vec![1.0; region.len()];
            }
            dists.iter().map(|&d| gaussian(d, 0.0, radius / 2.0)).collect()
        }
        _ => vec![1.0; region.len()],
    }
}

/// Unit-peak 1/f^beta time course; a constant for single-sample trials.
fn time_course(n_times: usize, beta: f64, rng: &mut StdRng) -> EsinetResult<Array1<f64>> {
    if n_times == 1 {
        return Ok(Array1::ones(1));
    }
    let noise = create_n_dim_noise(&[n_times], beta, rng)?;
    let course: Array1<f64> = noise.iter().copied().collect();
    let peak = course.iter().fold(0.0f64, |m, v| m.max(v.abs()));
    Ok(if peak > 0.0 { course / peak } else { Array1::ones(n_times) })
}
