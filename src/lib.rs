//! # esinet
//!
//! Tools for the EEG/MEG inverse problem: estimating cortical source activity
//! from sensor measurements.
//!
//! ## Overview
//!
//! A forward model maps dipole activity on a cortical mesh to sensor
//! potentials. esinet simulates paired source/sensor data with it, trains a
//! dense network to invert the mapping, and also offers the classical linear
//! solvers (MNE, dSPM, sLORETA, eLORETA, LCMV) for comparison.
//!
//! ## Structure
//!
//! - [`data`] — Sensor containers (`Raw`, `Epochs`, `Evoked`) and `SourceEstimate`
//! - [`forward`] — Forward models, orientation handling, bundle IO
//! - [`mesh`] — Mesh adjacency and region growing
//! - [`noise`] — Colored noise synthesis, baselines, SNR estimation
//! - [`simulation`] — Random source configurations and their sensor responses
//! - [`convert`] — Reshaping between simulation, container and array layouts
//! - [`inverse`] — Covariance estimation and classical inverse solvers
//! - [`net`] — Dense network training (Rayon-parallel gradients) and prediction
//! - [`calculate`] — SNR estimate, simulation, training and prediction in one call
//! - [`plotting`] — Multi-page PDF and PNG export of figures
//! - [`logging`] — File-backed log handles
//! - [`utils`] — Error metrics and small numeric helpers

pub mod calculate;
pub mod convert;
pub mod data;
pub mod error;
pub mod forward;
pub mod inverse;
pub mod logging;
pub mod mesh;
pub mod net;
pub mod noise;
pub mod plotting;
pub mod simulation;
pub mod utils;

pub use calculate::{calculate_source, CalculateOptions};
pub use data::{Epochs, Evoked, Info, Raw, SensorData, SimulationInfo, SourceEstimate};
pub use error::{EsinetError, EsinetResult, SolverError};
pub use forward::{unpack_fwd, ForwardModel, Orientation, SourceSpace};
pub use inverse::{mne_inverse, wrap_mne_inverse, BatchOptions, FailurePolicy, InverseMethod, InverseParams};
pub use logging::{custom_logger, FileLogger};
pub use net::{load_net, ModelType, Net, NetConfig, TrainOptions};
pub use plotting::{multipage, Figure, TracesFigure};
pub use simulation::{DurationOfTrial, Simulation, SimulationSettings, SourceShape};
