//! Linear inverse operators.
//!
//! All operators are built in the whitened sensor space and returned as a
//! dipoles × channels kernel that already includes the whitener, so applying
//! one is a single matrix product with the sensor data.

use nalgebra::{DMatrix, DVector, SymmetricEigen};
use ndarray::Array2;

use super::{covariance::Covariance, InverseMethod};
use crate::error::SolverError;

/// Eigenvalues below this fraction of the largest are treated as zero.
const RANK_TOLERANCE: f64 = 1e-10;

const ELORETA_MAX_ITER: usize = 20;
const ELORETA_EPS: f64 = 1e-6;

pub(crate) fn to_dmatrix(a: &Array2<f64>) -> DMatrix<f64> {
    let (rows, cols) = a.dim();
    DMatrix::from_fn(rows, cols, |r, c| a[[r, c]])
}

pub(crate) fn to_array2(m: &DMatrix<f64>) -> Array2<f64> {
    Array2::from_shape_fn((m.nrows(), m.ncols()), |(r, c)| m[(r, c)])
}

/// Rank × channels whitener `Λ^{-1/2} Uᵀ` from the eigendecomposition of `cov`.
///
/// Directions with (numerically) zero variance are dropped, which handles the
/// rank deficiency introduced by an average reference.
pub(crate) fn whitener(cov: &Covariance) -> Result<DMatrix<f64>, SolverError> {
    let c = to_dmatrix(&cov.data);
    let n = c.nrows();
    let eig = SymmetricEigen::new(c);
    let max = eig.eigenvalues.iter().copied().fold(0.0f64, f64::max);
    if !(max.is_finite() && max > 0.0) {
        return Err(SolverError::NotPositiveDefinite {
            matrix: "noise covariance",
        });
    }

    let keep: Vec<usize> = (0..n)
        .filter(|&i| eig.eigenvalues[i] > max * RANK_TOLERANCE)
        .collect();
    let mut w = DMatrix::zeros(keep.len(), n);
    for (row, &k) in keep.iter().enumerate() {
        let scale = 1.0 / eig.eigenvalues[k].sqrt();
        for ch in 0..n {
            w[(row, ch)] = eig.eigenvectors[(ch, k)] * scale;
        }
    }
    Ok(w)
}

fn spd_inverse(m: DMatrix<f64>, name: &'static str) -> Result<DMatrix<f64>, SolverError> {
    m.cholesky()
        .map(|c| c.inverse())
        .ok_or(SolverError::NotPositiveDefinite { matrix: name })
}

/// Minimum-norm family kernel (dipoles × channels).
///
/// With `G = W L` the whitened gain rescaled so that `trace(G Gᵀ)` equals the
/// whitened rank, the base operator is `Gᵀ (G Gᵀ + λ² I)⁻¹`. dSPM divides every
/// row by its noise sensitivity, sLORETA by the square root of the resolution
/// matrix diagonal. eLORETA replaces the identity source prior by iteratively
/// estimated weights.
pub fn minimum_norm_kernel(
    leadfield: &Array2<f64>,
    noise_cov: &Covariance,
    lambda2: f64,
    method: InverseMethod,
) -> Result<Array2<f64>, SolverError> {
    let w = whitener(noise_cov)?;
    let mut g = &w * to_dmatrix(leadfield);
    let rank = g.nrows();
    let gram_trace = (&g * g.transpose()).trace();
    if !(gram_trace.is_finite() && gram_trace > 0.0) {
        return Err(SolverError::Singular { matrix: "leadfield" });
    }
    g *= (rank as f64 / gram_trace).sqrt();

    let mut kernel = match method {
        InverseMethod::ELoreta => eloreta_kernel(&g, lambda2)?,
        _ => {
            let gram = &g * g.transpose() + DMatrix::identity(rank, rank) * lambda2;
            g.transpose() * spd_inverse(gram, "gram matrix")?
        }
    };

    match method {
        InverseMethod::Dspm => {
            for mut row in kernel.row_iter_mut() {
                let norm = row.norm();
                if norm > 0.0 {
                    row /= norm;
                }
            }
        }
        InverseMethod::SLoreta => {
            for i in 0..kernel.nrows() {
                // a dipole the sensors cannot see keeps its zero row
                if g.column(i).norm() == 0.0 {
                    continue;
                }
                let r_ii = kernel.row(i).dot(&g.column(i).transpose());
                if r_ii <= 0.0 {
                    return Err(SolverError::Singular {
                        matrix: "resolution matrix",
                    });
                }
                let scale = r_ii.sqrt();
                kernel.row_mut(i).apply(|v| *v /= scale);
            }
        }
        _ => {}
    }

    Ok(to_array2(&(kernel * w)))
}

/// eLORETA: `K = R Gᵀ (G R Gᵀ + λ² I)⁻¹` with diagonal `R = diag(1/w)`, where
/// `w_i = sqrt(g_iᵀ M g_i)` is iterated to a fixed point.
fn eloreta_kernel(g: &DMatrix<f64>, lambda2: f64) -> Result<DMatrix<f64>, SolverError> {
    let (rank, n_dipoles) = g.shape();
    let mut r = DVector::from_element(n_dipoles, 1.0);

    for _ in 0..ELORETA_MAX_ITER {
        let gr = scale_columns(g, &r);
        let gram = &gr * g.transpose() + DMatrix::identity(rank, rank) * lambda2;
        let m = spd_inverse(gram, "eLORETA gram matrix")?;

        let mut next = DVector::zeros(n_dipoles);
        for i in 0..n_dipoles {
            // zero prior weight for zero-gain dipoles
            if g.column(i).norm() == 0.0 {
                continue;
            }
            let mg = &m * g.column(i);
            let wi = g.column(i).dot(&mg).sqrt();
            if !(wi.is_finite() && wi > 0.0) {
                return Err(SolverError::Singular {
                    matrix: "eLORETA weights",
                });
            }
            next[i] = 1.0 / wi;
        }
        // keep the prior on the same overall scale as the identity
        let mean = next.mean();
        next /= mean;

        let change = (&next - &r).norm() / r.norm();
        r = next;
        if change < ELORETA_EPS {
            break;
        }
    }

    let gr = scale_columns(g, &r);
    let gram = &gr * g.transpose() + DMatrix::identity(rank, rank) * lambda2;
    Ok(gr.transpose() * spd_inverse(gram, "eLORETA gram matrix")?)
}

fn scale_columns(g: &DMatrix<f64>, r: &DVector<f64>) -> DMatrix<f64> {
    let mut out = g.clone();
    for (i, mut col) in out.column_iter_mut().enumerate() {
        col *= r[i];
    }
    out
}

/// LCMV beamformer filter (dipoles × channels).
///
/// The data covariance is loaded by `reg · trace(C) / n`. When a noise
/// covariance is given, gain and data covariance are whitened with it first.
/// Unit-gain weights are `C⁻¹ g / (gᵀ C⁻¹ g)`; unit-noise-gain weights are
/// `C⁻¹ g / sqrt(gᵀ C⁻² g)`.
pub fn lcmv_filter(
    leadfield: &Array2<f64>,
    data_cov: &Covariance,
    noise_cov: Option<&Covariance>,
    reg: f64,
    unit_noise_gain: bool,
) -> Result<Array2<f64>, SolverError> {
    let n_channels = leadfield.nrows();
    let w = match noise_cov {
        Some(cov) => whitener(cov)?,
        None => DMatrix::identity(n_channels, n_channels),
    };
    let g = &w * to_dmatrix(leadfield);
    if g.column_iter().all(|col| col.norm() == 0.0) {
        return Err(SolverError::Singular { matrix: "leadfield" });
    }
    let mut c = &w * to_dmatrix(&data_cov.data) * w.transpose();
    let n = c.nrows();
    let load = reg * c.trace() / n.max(1) as f64;
    for i in 0..n {
        c[(i, i)] += load;
    }
    let c_inv = spd_inverse(c, "data covariance")?;

    let mut filters = DMatrix::zeros(g.ncols(), n);
    for i in 0..g.ncols() {
        if g.column(i).norm() == 0.0 {
            continue;
        }
        let v = &c_inv * g.column(i);
        let denom = if unit_noise_gain {
            v.norm()
        } else {
            g.column(i).dot(&v)
        };
        if !(denom.is_finite() && denom > 0.0) {
            return Err(SolverError::Singular {
                matrix: "data covariance",
            });
        }
        filters.row_mut(i).copy_from(&(v / denom).transpose());
    }

    Ok(to_array2(&(filters * w)))
}
