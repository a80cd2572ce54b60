//! esinet command line.
//!
//! ```text
//! # simulate training pairs from a forward bundle
//! esinet simulate --bundle data/fsaverage --n-samples 1000 --output sim.json
//!
//! # train a network and log epoch metrics as JSONL
//! esinet train --bundle data/fsaverage --output models/fc --metrics-file metrics.jsonl
//!
//! # apply a trained network, or a classical solver, to recorded data
//! esinet solve --model models/fc --data evoked.json --output stc.json
//! esinet inverse --bundle data/fsaverage --data evoked.json --method dspm --output stc.json
//! ```

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use esinet::forward::{load_fwd, load_info, read_json, write_json};
use esinet::inverse::WeightNorm;
use esinet::net::EpochMetrics;
use esinet::{
    load_net, mne_inverse, DurationOfTrial, Epochs, EsinetError, EsinetResult, InverseMethod, InverseParams,
    ModelType, Net, NetConfig, SensorData, Simulation, SimulationSettings, SourceEstimate, TrainOptions,
};

#[derive(Parser, Debug)]
#[command(name = "esinet")]
#[command(author, version, about = "EEG/MEG source estimation", long_about = None)]
struct Cli {
    /// Logging verbosity level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Simulate paired source and sensor data
    Simulate {
        /// Forward bundle directory (info.json, fsaverage-fwd.json)
        #[arg(long)]
        bundle: PathBuf,

        /// Number of samples to simulate
        #[arg(long, default_value_t = 100)]
        n_samples: usize,

        /// Simulation settings (JSON); defaults when omitted
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Output file (JSON)
        #[arg(long)]
        output: PathBuf,

        /// Simulate samples in parallel
        #[arg(long, default_value_t = false)]
        parallel: bool,
    },

    /// Train a network on simulated data
    Train {
        /// Forward bundle directory
        #[arg(long)]
        bundle: PathBuf,

        /// Number of training samples to simulate
        #[arg(long, default_value_t = 10_000)]
        n_samples: usize,

        /// Simulation settings (JSON)
        #[arg(long)]
        settings: Option<PathBuf>,

        /// Network configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Temporal context in samples on each side; 0 trains a single-sample network
        #[arg(long, default_value_t = 0)]
        context: usize,

        /// Number of training epochs
        #[arg(long, default_value_t = 100)]
        epochs: usize,

        /// Mini-batch size
        #[arg(long, default_value_t = 8)]
        batch_size: usize,

        #[arg(long, default_value_t = 0.001)]
        learning_rate: f32,

        /// Fraction of pairs held out for validation
        #[arg(long, default_value_t = 0.1)]
        validation_split: f32,

        /// Output directory for the trained network
        #[arg(long)]
        output: PathBuf,

        /// Name of the network file inside the output directory
        #[arg(long, default_value = "instance")]
        name: String,

        /// Output metrics file (JSONL)
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },

    /// Estimate sources with a trained network
    Solve {
        /// Directory written by `train`
        #[arg(long)]
        model: PathBuf,

        #[arg(long, default_value = "instance")]
        name: String,

        /// Sensor data (JSON epochs, evoked or raw)
        #[arg(long)]
        data: PathBuf,

        /// Output file for the source estimates (JSON)
        #[arg(long)]
        output: PathBuf,
    },

    /// Estimate sources with a classical inverse solver
    Inverse {
        #[arg(long)]
        bundle: PathBuf,

        #[arg(long)]
        data: PathBuf,

        /// mne, dspm, sloreta, eloreta or lcmv
        #[arg(long, default_value = "eloreta")]
        method: InverseMethod,

        #[arg(long, default_value_t = 3.0)]
        snr: f64,

        /// Beamformer weight normalization (unit-noise-gain)
        #[arg(long)]
        weight_norm: Option<WeightNorm>,

        /// Baseline start in seconds
        #[arg(long)]
        baseline_start: Option<f64>,

        /// Baseline end in seconds
        #[arg(long)]
        baseline_end: Option<f64>,

        #[arg(long)]
        output: PathBuf,
    },
}

/// Sensor and source data of a simulation, as written by `simulate`.
#[derive(Serialize)]
struct SimulationDump<'a> {
    eeg: &'a [Epochs],
    sources: &'a [SourceEstimate],
}

fn main() {
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        eprintln!("failed to install the log subscriber");
    }

    info!("esinet v{}", env!("CARGO_PKG_VERSION"));
    if let Err(e) = run(cli.command) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(command: Commands) -> EsinetResult<()> {
    match command {
        Commands::Simulate {
            bundle,
            n_samples,
            settings,
            output,
            parallel,
        } => {
            let sim = simulate(&bundle, settings.as_deref(), n_samples, parallel)?;
            write_json(
                &output,
                &SimulationDump {
                    eeg: &sim.eeg_data,
                    sources: &sim.source_data,
                },
            )?;
            info!("wrote {} samples to {}", sim.n_samples(), output.display());
        }
        Commands::Train {
            bundle,
            n_samples,
            settings,
            config,
            context,
            epochs,
            batch_size,
            learning_rate,
            validation_split,
            output,
            name,
            metrics_file,
        } => {
            let mut net_config: NetConfig = match config {
                Some(path) => read_json(&path)?,
                None => NetConfig::default(),
            };
            if context > 0 {
                net_config.model_type = ModelType::Temporal { context };
            }
            let sim = simulate(&bundle, settings.as_deref(), n_samples, true)?;
            let options = TrainOptions {
                epochs,
                batch_size,
                learning_rate,
                validation_split,
                ..TrainOptions::default()
            };

            let mut net = Net::new(&sim.forward, net_config)?;
            let history = net.fit(&sim, &options)?;
            if let Some(path) = metrics_file {
                write_metrics(&path, history)?;
            }
            net.save(&output, &name)?;
        }
        Commands::Solve {
            model,
            name,
            data,
            output,
        } => {
            let net = load_net(&model, &name)?;
            let data: SensorData = read_json(&data)?;
            let estimates = net.predict(&data)?;
            write_json(&output, &estimates)?;
            info!("wrote {} estimate(s) to {}", estimates.len(), output.display());
        }
        Commands::Inverse {
            bundle,
            data,
            method,
            snr,
            weight_norm,
            baseline_start,
            baseline_end,
            output,
        } => {
            let fwd = load_fwd(&bundle)?;
            let data: SensorData = read_json(&data)?;
            let params = InverseParams {
                method,
                snr,
                baseline: (baseline_start, baseline_end),
                weight_norm,
                ..InverseParams::default()
            };
            let stc = mne_inverse(&fwd, &data, &params)?;
            write_json(&output, &stc)?;
            info!("wrote {} estimate to {}", method, output.display());
        }
    }
    Ok(())
}

fn simulate(bundle: &Path, settings: Option<&Path>, n_samples: usize, parallel: bool) -> EsinetResult<Simulation> {
    let fwd = Arc::new(load_fwd(bundle)?);
    let info = load_info(bundle)?;
    let settings: SimulationSettings = match settings {
        Some(path) => read_json(path)?,
        None => SimulationSettings {
            duration_of_trial: DurationOfTrial::Fixed(0.0),
            ..SimulationSettings::default()
        },
    };
    let mut sim = Simulation::new(fwd, info, settings, parallel)?;
    sim.simulate(n_samples)?;
    Ok(sim)
}

/// Append one `{"type": "epoch", ...}` line per epoch.
fn write_metrics(path: &Path, history: &[EpochMetrics]) -> EsinetResult<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| EsinetError::io(parent, e))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| EsinetError::io(path, e))?;
    for metrics in history {
        let mut event = serde_json::to_value(metrics)?;
        event["type"] = serde_json::json!("epoch");
        writeln!(file, "{event}").map_err(|e| EsinetError::io(path, e))?;
    }
    Ok(())
}
