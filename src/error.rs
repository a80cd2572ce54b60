//! Error types for esinet operations.

use std::path::PathBuf;
use thiserror::Error;

/// Numerical failure inside a classical inverse solver.
///
/// These are the only errors [`wrap_mne_inverse`](crate::inverse::wrap_mne_inverse)
/// may replace with a zero-filled estimate.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SolverError {
    /// Covariance (or gram) matrix could not be Cholesky-factored
    #[error("{matrix} is not positive definite")]
    NotPositiveDefinite {
        /// Which matrix failed
        matrix: &'static str,
    },

    /// Matrix inversion failed
    #[error("{matrix} is singular")]
    Singular {
        /// Which matrix failed
        matrix: &'static str,
    },

    /// No samples fell inside the requested time window
    #[error("no samples in window [{tmin:?}, {tmax:?}]")]
    EmptyWindow {
        /// Window start in seconds
        tmin: Option<f64>,
        /// Window end in seconds
        tmax: Option<f64>,
    },
}

/// Error type for every fallible esinet operation.
#[derive(Error, Debug)]
pub enum EsinetError {
    /// Array shape does not match the declared dimensions
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    /// A sensor container variant was passed where another was required
    #[error("data is of type {got} but should be {expected}")]
    UnsupportedContainer {
        /// Accepted variants
        expected: &'static str,
        /// Received variant
        got: &'static str,
    },

    /// Colored noise requested for an unsupported number of dimensions
    #[error("noise of {0} dimensions is not supported (1 to 4)")]
    UnsupportedDimensionality(usize),

    /// Invalid configuration value
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// Index outside of the valid range
    #[error("index {index} out of range for {len} elements")]
    InvalidIndex {
        /// Offending index
        index: usize,
        /// Number of valid elements
        len: usize,
    },

    /// Baseline window has zero variability or no samples
    #[error("baseline window {0:?} has no usable signal")]
    DegenerateBaseline((f64, f64)),

    /// Unrecognized inverse method name
    #[error("unknown inverse method {0:?}")]
    UnknownMethod(String),

    /// Classical solver failure
    #[error("solver failed: {0}")]
    Solver(#[from] SolverError),

    /// File system error
    #[error("{path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Rendering error
    #[error("plot error: {0}")]
    Plot(String),
}

impl EsinetError {
    /// Wrap an I/O error with the path that produced it.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EsinetError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias for esinet operations.
pub type EsinetResult<T> = Result<T, EsinetError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_container_message_names_type() {
        let err = EsinetError::UnsupportedContainer {
            expected: "Evoked or Epochs",
            got: "Raw",
        };
        let msg = err.to_string();
        assert!(msg.contains("Raw"));
        assert!(msg.contains("Evoked or Epochs"));
    }

    #[test]
    fn test_solver_error_converts() {
        let err: EsinetError = SolverError::Singular { matrix: "gram" }.into();
        assert!(matches!(err, EsinetError::Solver(SolverError::Singular { .. })));
    }
}
