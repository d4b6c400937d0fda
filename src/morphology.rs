//! Binary morphology on 3D masks: connected components, slice-wise hole
//! filling and the Euclidean nearest-feature transform.

use std::collections::VecDeque;

use ndarray::{Array2, Array3, ArrayViewMut2, Axis};

/// Voxel neighbourhood used when growing components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// 6 neighbours sharing a face.
    Face,
    /// 26 neighbours sharing a face, edge or corner.
    Full,
}

impl Connectivity {
    fn offsets(self) -> Vec<[isize; 3]> {
        let mut offsets = Vec::with_capacity(26);
        for dx in -1..=1isize {
            for dy in -1..=1isize {
                for dz in -1..=1isize {
                    let steps = dx.abs() + dy.abs() + dz.abs();
                    let keep = match self {
                        Connectivity::Face => steps == 1,
                        Connectivity::Full => steps > 0,
                    };
                    if keep {
                        offsets.push([dx, dy, dz]);
                    }
                }
            }
        }
        offsets
    }
}

/// Component id per voxel (0 = outside the mask) and the size of each
/// component, indexed by `id - 1`. Ids are assigned in scan order.
pub fn label_components(mask: &Array3<bool>, connectivity: Connectivity) -> (Array3<u32>, Vec<usize>) {
    let (nx, ny, nz) = mask.dim();
    let offsets = connectivity.offsets();
    let mut labels = Array3::<u32>::zeros((nx, ny, nz));
    let mut sizes = Vec::new();
    let mut queue = VecDeque::new();

    for ((i, j, k), &inside) in mask.indexed_iter() {
        if !inside || labels[[i, j, k]] != 0 {
            continue;
        }
        let id = sizes.len() as u32 + 1;
        let mut size = 0usize;
        labels[[i, j, k]] = id;
        queue.push_back([i, j, k]);

        while let Some([x, y, z]) = queue.pop_front() {
            size += 1;
            for [dx, dy, dz] in &offsets {
                let (Some(a), Some(b), Some(c)) = (
                    x.checked_add_signed(*dx).filter(|v| *v < nx),
                    y.checked_add_signed(*dy).filter(|v| *v < ny),
                    z.checked_add_signed(*dz).filter(|v| *v < nz),
                ) else {
                    continue;
                };
                if mask[[a, b, c]] && labels[[a, b, c]] == 0 {
                    labels[[a, b, c]] = id;
                    queue.push_back([a, b, c]);
                }
            }
        }
        sizes.push(size);
    }

    (labels, sizes)
}

/// Mask of the largest connected component. Ties go to the component found
/// first in scan order; an empty mask stays empty.
pub fn largest_component(mask: &Array3<bool>, connectivity: Connectivity) -> Array3<bool> {
    let (labels, sizes) = label_components(mask, connectivity);
    let Some(largest) = sizes
        .iter()
        .enumerate()
        .rev()
        .max_by_key(|(_, size)| **size)
        .map(|(idx, _)| idx as u32 + 1)
    else {
        return Array3::from_elem(mask.dim(), false);
    };
    labels.mapv(|id| id == largest)
}

/// Fill background regions that do not touch the border of their slice,
/// independently for every slice perpendicular to `axis`.
pub fn fill_holes_per_slice(mask: &mut Array3<bool>, axis: Axis) {
    for slice in mask.axis_iter_mut(axis) {
        fill_holes_2d(slice);
    }
}

fn fill_holes_2d(mut slice: ArrayViewMut2<'_, bool>) {
    let (h, w) = slice.dim();
    if h == 0 || w == 0 {
        return;
    }
    let mut outside = Array2::<bool>::from_elem((h, w), false);
    let mut queue = VecDeque::new();

    let border = (0..h)
        .flat_map(|r| [(r, 0), (r, w - 1)])
        .chain((0..w).flat_map(|c| [(0, c), (h - 1, c)]));
    for (r, c) in border {
        if !slice[[r, c]] && !outside[[r, c]] {
            outside[[r, c]] = true;
            queue.push_back((r, c));
        }
    }

    while let Some((r, c)) = queue.pop_front() {
        let neighbours = [
            (r.wrapping_sub(1), c),
            (r + 1, c),
            (r, c.wrapping_sub(1)),
            (r, c + 1),
        ];
        for (nr, nc) in neighbours {
            if nr < h && nc < w && !slice[[nr, nc]] && !outside[[nr, nc]] {
                outside[[nr, nc]] = true;
                queue.push_back((nr, nc));
            }
        }
    }

    slice.zip_mut_with(&outside, |value, &out| {
        if !out {
            *value = true;
        }
    });
}

/// Marker for voxels with no feature in reach.
const NO_FEATURE: usize = usize::MAX;

/// For every voxel, the flat (row-major) index of the closest `true` voxel
/// of `features` in Euclidean distance (voxel units).
///
/// Returns `None` when `features` has no `true` voxel. Uses the separable
/// lower-envelope algorithm of Felzenszwalb and Huttenlocher, carrying the
/// feature index through each axis pass, so the result is exact.
pub fn nearest_feature(features: &Array3<bool>) -> Option<Array3<usize>> {
    let (nx, ny, nz) = features.dim();
    let dims = [nx, ny, nz];
    let strides = [ny * nz, nz, 1];
    let coords = |flat: usize| unravel(flat, (nx, ny, nz));

    let mut nearest: Vec<usize> = features
        .iter()
        .enumerate()
        .map(|(flat, &f)| if f { flat } else { NO_FEATURE })
        .collect();
    if nearest.iter().all(|&n| n == NO_FEATURE) {
        return None;
    }

    let mut line_cost = Vec::new();
    let mut line_arg = Vec::new();
    let mut line_feature = Vec::new();
    for axis in 0..3 {
        let len = dims[axis];
        let others: Vec<usize> = (0..3).filter(|a| *a != axis).collect();
        for u in 0..dims[others[0]] {
            for v in 0..dims[others[1]] {
                let start = u * strides[others[0]] + v * strides[others[1]];
                let at = |t: usize| start + t * strides[axis];

                line_cost.clear();
                line_feature.clear();
                for t in 0..len {
                    let feature = nearest[at(t)];
                    line_feature.push(feature);
                    line_cost.push(if feature == NO_FEATURE {
                        f64::INFINITY
                    } else {
                        let (p, q) = (coords(at(t)), coords(feature));
                        (0..3)
                            .map(|d| (p[d] as f64 - q[d] as f64).powi(2))
                            .sum::<f64>()
                    });
                }

                lower_envelope(&line_cost, &mut line_arg);
                for t in 0..len {
                    let source = line_arg[t];
                    nearest[at(t)] = if source == NO_FEATURE {
                        NO_FEATURE
                    } else {
                        line_feature[source]
                    };
                }
            }
        }
    }

    debug_assert!(nearest.iter().all(|&n| n != NO_FEATURE));
    Array3::from_shape_vec((nx, ny, nz), nearest).ok()
}

/// Row-major `(i, j, k)` of a flat index into an array of shape `dims`.
pub fn unravel(flat: usize, dims: (usize, usize, usize)) -> [usize; 3] {
    let (_, ny, nz) = dims;
    [flat / (ny * nz), (flat / nz) % ny, flat % nz]
}

/// 1D squared-distance transform: `arg[q]` is the `p` minimising
/// `(q - p)^2 + cost[p]`, or `NO_FEATURE` if every cost is infinite.
fn lower_envelope(cost: &[f64], arg: &mut Vec<usize>) {
    let n = cost.len();
    arg.clear();
    arg.resize(n, NO_FEATURE);

    let mut hull: Vec<usize> = Vec::with_capacity(n);
    let mut bounds: Vec<f64> = Vec::with_capacity(n + 1);
    for q in 0..n {
        if !cost[q].is_finite() {
            continue;
        }
        let fq = cost[q] + (q * q) as f64;
        loop {
            let Some(&p) = hull.last() else {
                hull.push(q);
                bounds.clear();
                bounds.push(f64::NEG_INFINITY);
                break;
            };
            let fp = cost[p] + (p * p) as f64;
            let s = (fq - fp) / (2.0 * (q as f64 - p as f64));
            if s <= bounds[bounds.len() - 1] {
                hull.pop();
                bounds.pop();
                continue;
            }
            hull.push(q);
            bounds.push(s);
            break;
        }
    }
    if hull.is_empty() {
        return;
    }

    let mut k = 0;
    for (q, slot) in arg.iter_mut().enumerate() {
        while k + 1 < hull.len() && bounds[k + 1] < q as f64 {
            k += 1;
        }
        *slot = hull[k];
    }
}
