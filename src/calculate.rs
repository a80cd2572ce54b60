//! All-in-one source estimation: simulate, train and predict in one call.

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::{SensorData, SourceEstimate};
use crate::error::EsinetResult;
use crate::forward::ForwardModel;
use crate::net::{Net, NetConfig, TrainOptions};
use crate::noise::calc_snr_range;
use crate::simulation::{DurationOfTrial, Simulation, SimulationSettings};

/// Options for [`calculate_source`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalculateOptions {
    /// Baseline window in seconds, used to estimate the SNR
    pub baseline_span: (f64, f64),
    /// Signal window in seconds
    pub data_span: (f64, f64),
    /// Number of simulated training pairs
    pub n_samples: usize,
    pub parallel: bool,
    /// Simulation ranges; SNR and trial duration are overridden
    pub settings: SimulationSettings,
    pub net: NetConfig,
    pub train: TrainOptions,
}

impl Default for CalculateOptions {
    fn default() -> Self {
        Self {
            baseline_span: (-0.2, 0.0),
            data_span: (0.0, 0.5),
            n_samples: 10_000,
            parallel: false,
            settings: SimulationSettings::default(),
            net: NetConfig::default(),
            train: TrainOptions {
                validation_split: 0.1,
                epochs: 100,
                ..TrainOptions::default()
            },
        }
    }
}

/// Estimate sources of `data` with a network trained on simulations matching
/// its SNR.
///
/// # Errors
/// Propagates SNR estimation, simulation and training failures.
pub fn calculate_source(
    data: &SensorData,
    forward: Arc<ForwardModel>,
    options: &CalculateOptions,
) -> EsinetResult<Vec<SourceEstimate>> {
    let start = Instant::now();
    let snr = calc_snr_range(data, options.baseline_span, options.data_span)?;
    info!("estimated SNR: {:.2}", snr);

    let settings = SimulationSettings {
        duration_of_trial: DurationOfTrial::Fixed(0.0),
        ..options.settings.clone()
    }
    .with_snr(snr);
    let mut sim = Simulation::new(Arc::clone(&forward), data.info().clone(), settings, options.parallel)?;
    sim.simulate(options.n_samples)?;

    let mut net = Net::new(&forward, options.net.clone())?;
    net.fit(&sim, &options.train)?;
    let estimates = net.predict(data)?;

    info!(
        "calculate_source: {} estimate(s) in {:.2?}",
        estimates.len(),
        start.elapsed()
    );
    Ok(estimates)
}
