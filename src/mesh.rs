//! Cortical mesh adjacency and region growing.
//!
//! Vertices of the two hemispheres share one contiguous index space: the left
//! hemisphere occupies `0..n_left`, the right hemisphere `n_left..n_left + n_right`.

use ndarray::Array2;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{EsinetError, EsinetResult};
use crate::forward::ForwardModel;

/// Map every vertex number used by `tris` onto `0..n`, keeping sort order.
fn renumber(tris: &[[usize; 3]]) -> (Vec<[usize; 3]>, usize) {
    let unique: BTreeSet<usize> = tris.iter().flatten().copied().collect();
    let lookup: BTreeMap<usize, usize> = unique
        .iter()
        .enumerate()
        .map(|(new, &old)| (old, new))
        .collect();
    let renumbered = tris
        .iter()
        .map(|tri| [lookup[&tri[0]], lookup[&tri[1]], lookup[&tri[2]]])
        .collect();
    (renumbered, unique.len())
}

/// Direct neighbors of every vertex of a bihemispheric triangulated surface.
///
/// Each hemisphere's vertex numbers are renumbered to a contiguous range and the
/// right hemisphere is offset by the left hemisphere's vertex count. Neighbor
/// lists are sorted, free of duplicates and never contain the vertex itself.
pub fn get_triangle_neighbors(tris_lr: [&[[usize; 3]]; 2]) -> Vec<Vec<usize>> {
    let (left, n_left) = renumber(tris_lr[0]);
    let (right, n_right) = renumber(tris_lr[1]);

    let mut neighbors: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n_left + n_right];
    let hemispheres = [(left, 0usize), (right, n_left)];
    for (tris, offset) in &hemispheres {
        for tri in tris {
            let tri = tri.map(|v| v + offset);
            for &a in &tri {
                for &b in &tri {
                    if a != b {
                        neighbors[a].insert(b);
                    }
                }
            }
        }
    }

    neighbors
        .into_iter()
        .map(|set| set.into_iter().collect())
        .collect()
}

/// Direct neighbors of every dipole of a forward model.
///
/// # Errors
/// `ShapeMismatch` when some used dipole is not part of any triangle.
pub fn get_neighbors(fwd: &ForwardModel) -> EsinetResult<Vec<Vec<usize>>> {
    let neighbors =
        get_triangle_neighbors([fwd.src[0].use_tris.as_slice(), fwd.src[1].use_tris.as_slice()]);
    if neighbors.len() != fwd.n_sources() {
        return Err(EsinetError::ShapeMismatch(format!(
            "mesh covers {} vertices but the source model has {} dipoles",
            neighbors.len(),
            fwd.n_sources()
        )));
    }
    Ok(neighbors)
}

/// Grow a region from `seed` by adding neighbors of every member, `order` times.
///
/// Returns the sorted, deduplicated member indices; order 0 yields `[seed]`.
///
/// # Errors
/// `InvalidIndex` when `seed` or a neighbor entry is outside `neighbors`.
pub fn get_n_order_indices(
    order: usize,
    seed: usize,
    neighbors: &[Vec<usize>],
) -> EsinetResult<Vec<usize>> {
    if seed >= neighbors.len() {
        return Err(EsinetError::InvalidIndex {
            index: seed,
            len: neighbors.len(),
        });
    }

    let mut region = BTreeSet::from([seed]);
    let mut frontier = vec![seed];
    for _ in 0..order {
        let mut next = Vec::new();
        for idx in frontier {
            let adjacent = neighbors.get(idx).ok_or(EsinetError::InvalidIndex {
                index: idx,
                len: neighbors.len(),
            })?;
            for &n in adjacent {
                if region.insert(n) {
                    next.push(n);
                }
            }
        }
        if next.is_empty() {
            break;
        }
        frontier = next;
    }

    Ok(region.into_iter().collect())
}

/// Estimated diameter (in the units of `pos`) of a region of the given order.
///
/// `median_j(min_{i != j} |pos_i - pos_j|) * (2 + order)`; coincident points are
/// ignored. `NaN` when fewer than two distinct positions exist.
#[allow(clippy::cast_precision_loss)]
pub fn get_source_diam_from_order(order: usize, pos: &Array2<f64>) -> f64 {
    let n = pos.nrows();
    let mut nearest: Vec<f64> = (0..n)
        .filter_map(|j| {
            (0..n)
                .filter(|&i| i != j)
                .map(|i| {
                    let d = &pos.row(i) - &pos.row(j);
                    d.dot(&d).sqrt()
                })
                .filter(|&d| d > 0.0)
                .reduce(f64::min)
        })
        .collect();

    if nearest.is_empty() {
        return f64::NAN;
    }
    nearest.sort_by(f64::total_cmp);
    let mid = nearest.len() / 2;
    let median = if nearest.len() % 2 == 0 {
        (nearest[mid - 1] + nearest[mid]) / 2.0
    } else {
        nearest[mid]
    };
    median * (2 + order) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    /// A 2×3 grid strip per hemisphere, with raw vertex numbers that have gaps.
    fn strip() -> Vec<[usize; 3]> {
        // 0 - 2 - 4
        // | / | / |
        // 1 - 3 - 5   (raw numbers are doubled: 0, 2, 4, ...)
        vec![[0, 2, 4], [2, 4, 6], [4, 6, 8], [6, 8, 10]]
    }

    #[test]
    fn test_neighbors_symmetric_no_self_no_duplicates() {
        let tris = strip();
        let neighbors = get_triangle_neighbors([tris.as_slice(), tris.as_slice()]);
        assert_eq!(neighbors.len(), 12);
        for (i, list) in neighbors.iter().enumerate() {
            assert!(!list.contains(&i), "vertex {i} lists itself");
            let unique: BTreeSet<_> = list.iter().collect();
            assert_eq!(unique.len(), list.len(), "duplicates for vertex {i}");
            for &j in list {
                assert!(neighbors[j].contains(&i), "{i} -> {j} not symmetric");
            }
        }
    }

    #[test]
    fn test_right_hemisphere_offset() {
        let tris = strip();
        let neighbors = get_triangle_neighbors([tris.as_slice(), tris.as_slice()]);
        assert_eq!(neighbors[0], vec![1, 2]);
        assert_eq!(neighbors[6], vec![7, 8]);
        assert!(neighbors[6..].iter().flatten().all(|&j| j >= 6));
    }

    #[test]
    fn test_unequal_hemispheres() {
        let left = vec![[0, 1, 2]];
        let right = strip();
        let neighbors = get_triangle_neighbors([left.as_slice(), right.as_slice()]);
        assert_eq!(neighbors.len(), 9);
        assert_eq!(neighbors[3], vec![4, 5]);
    }

    #[test]
    fn test_order_zero_returns_seed() {
        let tris = strip();
        let neighbors = get_triangle_neighbors([tris.as_slice(), tris.as_slice()]);
        assert_eq!(get_n_order_indices(0, 3, &neighbors).expect("grow"), vec![3]);
    }

    #[test]
    fn test_region_growth_is_monotone() {
        let tris = strip();
        let neighbors = get_triangle_neighbors([tris.as_slice(), tris.as_slice()]);
        let mut previous = get_n_order_indices(0, 0, &neighbors).expect("grow");
        for order in 1..5 {
            let current = get_n_order_indices(order, 0, &neighbors).expect("grow");
            assert!(previous.iter().all(|i| current.contains(i)));
            assert!(current.windows(2).all(|w| w[0] < w[1]), "sorted and unique");
            previous = current;
        }
        // the left strip is connected, the right one is not reachable
        assert_eq!(previous, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_seed_out_of_range() {
        let neighbors = vec![vec![1], vec![0]];
        assert!(matches!(
            get_n_order_indices(1, 2, &neighbors),
            Err(EsinetError::InvalidIndex { index: 2, len: 2 })
        ));
    }

    #[test]
    fn test_source_diameter() {
        let pos = ndarray::arr2(&[[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [3.0, 0.0, 0.0]]);
        // nearest distances: 1, 1, 2 -> median 1
        assert_abs_diff_eq!(get_source_diam_from_order(1, &pos), 3.0, epsilon = 1e-12);
        let single = ndarray::arr2(&[[0.0, 0.0, 0.0]]);
        assert!(get_source_diam_from_order(0, &single).is_nan());
    }
}
