//! Mesh, noise and conversion helpers on a small forward model.

mod common;

use approx::assert_abs_diff_eq;
use esinet::convert::{collapse, convert_simulation_temporal_to_single, uncollapse};
use esinet::mesh::{get_n_order_indices, get_neighbors};
use esinet::noise::{calc_snr_range, create_n_dim_noise};
use esinet::utils::{batch_corr, batch_nmse};
use esinet::{DurationOfTrial, Epochs, SensorData};
use ndarray::{Array2, Array3};
use rand::rngs::StdRng;
use rand::SeedableRng;

#[test]
fn test_region_growing_on_strip() {
    let fwd = common::forward();
    let neighbors = get_neighbors(&fwd).expect("neighbors");
    assert_eq!(neighbors.len(), 12);
    assert_eq!(get_n_order_indices(0, 0, &neighbors).expect("order 0"), vec![0]);
    // vertex 0 touches 1 and 3 only
    assert_eq!(get_n_order_indices(1, 0, &neighbors).expect("order 1"), vec![0, 1, 3]);
    // the right hemisphere is offset and never reached from the left
    let grown = get_n_order_indices(5, 0, &neighbors).expect("order 5");
    assert_eq!(grown, vec![0, 1, 2, 3, 4, 5]);
    assert!(get_n_order_indices(1, 12, &neighbors).is_err());
}

#[test]
fn test_noise_shape_and_dimensionality() {
    let mut rng = StdRng::seed_from_u64(1);
    let noise = create_n_dim_noise(&[8, 16], 2.0, &mut rng).expect("noise");
    assert_eq!(noise.shape(), &[8, 16]);
    assert!(noise.iter().all(|v| v.is_finite()));
    assert!(create_n_dim_noise(&[2, 2, 2, 2, 2], 2.0, &mut rng).is_err());
}

#[test]
fn test_snr_of_simulated_response() {
    let info = common::info();
    let trial = Array2::from_shape_fn((5, 40), |(c, t)| {
        let jitter = (((c * 5 + t * 3) % 7) as f64 - 3.0) * 0.01;
        if t < 20 {
            jitter
        } else {
            jitter + c as f64
        }
    });
    let data = SensorData::from(Epochs::single(info, trial, -0.2).expect("epochs"));
    let snr = calc_snr_range(&data, (-0.2, -0.01), (0.0, 0.19)).expect("snr");
    assert!(snr > 10.0, "snr = {snr}");
}

#[test]
fn test_temporal_to_single_keeps_every_sample() {
    let sim = common::simulation(DurationOfTrial::Fixed(0.1), 3);
    let total: usize = sim.eeg_data.iter().map(|e| e.n_times()).sum();
    let single = convert_simulation_temporal_to_single(&sim).expect("convert");
    assert!(!single.temporal);
    assert_eq!(single.n_samples(), total);
    assert!(single.eeg_data.iter().all(|e| e.n_times() == 1));
}

#[test]
fn test_collapse_and_metrics() {
    let x = Array3::from_shape_fn((2, 3, 4), |(s, d, t)| (s * 100 + d * 10 + t) as f64);
    let flat = collapse(&x);
    assert_eq!(flat.dim(), (8, 3));
    assert_eq!(uncollapse(&flat, 2).expect("uncollapse"), x);

    let y = Array2::from_shape_fn((4, 3), |(i, j)| (i + 2 * j) as f64 + 1.0);
    assert_abs_diff_eq!(batch_nmse(&y, &y).expect("nmse"), 0.0, epsilon = 1e-12);
    assert_abs_diff_eq!(batch_corr(&y, &(&y * 2.0)).expect("corr"), 1.0, epsilon = 1e-12);
}
