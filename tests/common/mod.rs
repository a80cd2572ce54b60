//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use esinet::{DurationOfTrial, ForwardModel, Info, Orientation, Simulation, SimulationSettings, SourceSpace};
use ndarray::Array2;

pub const SFREQ: f64 = 100.0;
pub const CHANNELS: [&str; 5] = ["Fz", "Cz", "Pz", "C3", "C4"];

/// 2 × 3 vertex strip per hemisphere, 12 dipoles and 5 EEG channels.
pub fn forward() -> ForwardModel {
    let hemisphere = |x: f64| SourceSpace {
        vertno: vec![0, 1, 2, 3, 4, 5],
        use_tris: vec![[0, 1, 3], [1, 4, 3], [1, 2, 4], [2, 5, 4]],
        rr: (0..6)
            .map(|v| [x, 0.01 * (v % 3) as f64, 0.01 * (v / 3) as f64])
            .collect(),
        nn: vec![[0.0, 0.0, 1.0]; 6],
        subject_his_id: Some("fsaverage".into()),
    };
    let leadfield = Array2::from_shape_fn((CHANNELS.len(), 12), |(r, c)| {
        ((r as f64 + 1.0) * (c as f64 + 0.5)).sin() + 0.1 * r as f64
    });
    ForwardModel::new(
        [hemisphere(-0.03), hemisphere(0.03)],
        leadfield,
        Orientation::Fixed,
        CHANNELS.iter().map(|s| s.to_string()).collect(),
    )
    .expect("forward model")
}

pub fn info() -> Info {
    Info::eeg(CHANNELS.iter().map(|s| s.to_string()).collect(), SFREQ)
}

pub fn simulation(duration: DurationOfTrial, n_samples: usize) -> Simulation {
    let settings = SimulationSettings {
        duration_of_trial: duration,
        number_of_sources: (1, 2),
        extents: (0, 1),
        seed: Some(7),
        ..SimulationSettings::default()
    };
    let mut sim = Simulation::new(Arc::new(forward()), info(), settings, true).expect("simulation");
    sim.simulate(n_samples).expect("simulate");
    sim
}
