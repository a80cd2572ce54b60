//! Small numeric helpers: RMS, column tiling, batch error metrics,
//! volume-to-surface interpolation and the Gaussian kernel.

use ndarray::{Array1, Array2, ArrayBase, ArrayD, Axis, Data, Dimension, Zip};

use crate::error::{EsinetError, EsinetResult};

/// Root mean square of all elements. `NaN` for empty input.
pub fn rms<S, D>(x: &ArrayBase<S, D>) -> f64
where
    S: Data<Elem = f64>,
    D: Dimension,
{
    x.mapv(|v| v * v).mean().map_or(f64::NAN, f64::sqrt)
}

/// Repeat `x` as each of `n` columns: output shape `(x.len(), n)`.
pub fn repeat_newcol(x: &[f64], n: usize) -> Array2<f64> {
    Array2::from_shape_fn((x.len(), n), |(i, _)| x[i])
}

/// Unnormalized Gaussian kernel `exp(-(x - mu)^2 / (2 sigma^2))`.
pub fn gaussian(x: f64, mu: f64, sigma: f64) -> f64 {
    (-(x - mu).powi(2) / (2.0 * sigma.powi(2))).exp()
}

fn check_same_shape(a: &Array2<f64>, b: &Array2<f64>) -> EsinetResult<()> {
    if a.dim() != b.dim() {
        return Err(EsinetError::ShapeMismatch(format!(
            "y_true {:?} vs y_pred {:?}",
            a.dim(),
            b.dim()
        )));
    }
    Ok(())
}

/// Divide every column by its maximum absolute value (`NaN` for all-zero columns).
fn scale_columns(y: &Array2<f64>) -> Array2<f64> {
    let mut out = y.clone();
    for mut col in out.axis_iter_mut(Axis(1)) {
        let peak = col.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        col.mapv_inplace(|v| v / peak);
    }
    out
}

/// Mean squared error after scaling each sample (column) to unit peak.
///
/// `NaN` entries, e.g. from all-zero samples, are ignored.
pub fn batch_nmse(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> EsinetResult<f64> {
    check_same_shape(y_true, y_pred)?;
    let t = scale_columns(y_true);
    let p = scale_columns(y_pred);
    let (sum, count) = t
        .iter()
        .zip(p.iter())
        .map(|(a, b)| (a - b).powi(2))
        .filter(|d| !d.is_nan())
        .fold((0.0, 0usize), |(s, c), d| (s + d, c + 1));
    Ok(if count == 0 { f64::NAN } else { sum / count as f64 })
}

/// Pearson correlation of the flattened arrays. `NaN` if either is constant.
pub fn batch_corr(y_true: &Array2<f64>, y_pred: &Array2<f64>) -> EsinetResult<f64> {
    check_same_shape(y_true, y_pred)?;
    let (Some(mt), Some(mp)) = (y_true.mean(), y_pred.mean()) else {
        return Ok(f64::NAN);
    };
    let mut cov = 0.0;
    let mut var_t = 0.0;
    let mut var_p = 0.0;
    Zip::from(y_true).and(y_pred).for_each(|&a, &b| {
        cov += (a - mt) * (b - mp);
        var_t += (a - mt).powi(2);
        var_p += (b - mp).powi(2);
    });
    Ok(cov / (var_t * var_p).sqrt())
}

/// Interpolate a volume onto an irregular grid by averaging, for each target,
/// the volume values at its precomputed nearest-neighbor indices.
///
/// `neighbor_indices` is targets × k, indexing the flattened (row-major) volume.
pub fn vol_to_src(neighbor_indices: &Array2<usize>, src_3d: &ArrayD<f64>) -> EsinetResult<Array1<f64>> {
    let flat: Vec<f64> = src_3d.iter().copied().collect();
    neighbor_indices
        .rows()
        .into_iter()
        .map(|row| {
            let mut sum = 0.0;
            for &idx in row {
                sum += *flat.get(idx).ok_or(EsinetError::InvalidIndex {
                    index: idx,
                    len: flat.len(),
                })?;
            }
            Ok(sum / row.len() as f64)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2, IxDyn};

    #[test]
    fn test_rms() {
        assert_abs_diff_eq!(rms(&arr1(&[1.0, -1.0, 1.0, -1.0])), 1.0, epsilon = 1e-12);
        assert_eq!(rms(&Array1::<f64>::zeros(6)), 0.0);
        assert!(rms(&Array1::<f64>::zeros(0)).is_nan());
    }

    #[test]
    fn test_repeat_newcol() {
        let out = repeat_newcol(&[1.0, 2.0, 3.0], 2);
        assert_eq!(out, arr2(&[[1.0, 1.0], [2.0, 2.0], [3.0, 3.0]]));
    }

    #[test]
    fn test_gaussian_peak_and_width() {
        assert_abs_diff_eq!(gaussian(2.0, 2.0, 1.0), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(gaussian(3.0, 2.0, 1.0), (-0.5f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn test_batch_corr_scaled_and_negated() {
        let y = arr2(&[[1.0, 4.0], [2.0, -1.0], [0.5, 3.0]]);
        let scaled = &y * 3.5;
        let negated = -&y;
        assert_abs_diff_eq!(batch_corr(&y, &scaled).expect("corr"), 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(batch_corr(&y, &negated).expect("corr"), -1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_batch_nmse_scale_invariant_per_column() {
        let y = arr2(&[[1.0, 4.0], [2.0, -1.0], [0.5, 3.0]]);
        let mut pred = y.clone();
        pred.column_mut(0).mapv_inplace(|v| v * 10.0);
        assert_abs_diff_eq!(batch_nmse(&y, &pred).expect("nmse"), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn test_batch_nmse_ignores_zero_columns() {
        let y = arr2(&[[1.0, 0.0], [0.0, 0.0]]);
        let pred = arr2(&[[0.0, 0.0], [1.0, 0.0]]);
        // first column contributes (1-0)^2 + (0-1)^2 over 2 entries
        assert_abs_diff_eq!(batch_nmse(&y, &pred).expect("nmse"), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = Array2::zeros((2, 3));
        let b = Array2::zeros((3, 2));
        assert!(batch_corr(&a, &b).is_err());
        assert!(batch_nmse(&a, &b).is_err());
    }

    #[test]
    fn test_vol_to_src() {
        let volume = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1.0, 2.0, 3.0, 4.0]).expect("volume");
        let neighbors = arr2(&[[0, 3], [1, 2]]);
        let out = vol_to_src(&neighbors, &volume).expect("interp");
        assert_eq!(out, arr1(&[2.5, 2.5]));
        assert!(vol_to_src(&arr2(&[[7usize]]), &volume).is_err());
    }
}
