//! Resampling to a voxel spacing and resizing to a voxel grid.
//!
//! Output voxels are pixel-centre aligned with the input: output index `d`
//! samples input coordinate `(d + 0.5) * scale - 0.5`. Coordinates outside
//! the input are clamped to the border.

use anyhow::Result;
use ndarray::{Array3, Zip};

use crate::volume::{Affine, Geometry, Volume};

/// How voxel values are sampled between grid points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Copy the closest voxel. The only mode allowed for label data.
    Nearest,
    /// Weighted mean of the 8 surrounding voxels.
    Trilinear,
}

/// Largest grid a resample or resize may allocate.
pub const MAX_VOXELS: usize = 1 << 30;

/// Reject grids whose voxel count overflows or exceeds [`MAX_VOXELS`].
pub fn check_grid(shape: [usize; 3]) -> Result<()> {
    let voxels = shape
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .filter(|&n| n <= MAX_VOXELS);
    if voxels.is_none() {
        anyhow::bail!("Grid {shape:?} exceeds the {MAX_VOXELS} voxel limit");
    }
    Ok(())
}

#[derive(Debug)]
struct SpacingPlan {
    shape: [usize; 3],
    scale: [f64; 3],
    affine: Affine,
}

fn plan_spacing(geometry: &Geometry, target: [f64; 3]) -> Result<SpacingPlan> {
    if target.iter().any(|t| !t.is_finite() || *t <= 0.0) {
        anyhow::bail!("Target spacing must be positive, got {target:?}");
    }
    let spacing = geometry.spacing();
    let mut shape = [0usize; 3];
    let mut scale = [0.0; 3];
    let mut affine = geometry.affine;
    for axis in 0..3 {
        scale[axis] = target[axis] / spacing[axis];
        let extent = geometry.shape[axis] as f64 * spacing[axis] / target[axis];
        if !extent.is_finite() || extent > MAX_VOXELS as f64 {
            anyhow::bail!("Spacing {spacing:?} to {target:?} gives an unusable extent on axis {axis}");
        }
        shape[axis] = (extent.round() as usize).max(1);

        let column = geometry.column(axis);
        let shift = 0.5 * scale[axis] - 0.5;
        for row in 0..3 {
            affine[row][axis] = column[row] * scale[axis];
            affine[row][3] += column[row] * shift;
        }
    }
    check_grid(shape)?;
    Ok(SpacingPlan {
        shape,
        scale,
        affine,
    })
}

#[inline]
fn source_coord(dst: usize, scale: f64) -> f64 {
    (dst as f64 + 0.5) * scale - 0.5
}

#[inline]
fn nearest_index(coord: f64, len: usize) -> usize {
    (coord.round().max(0.0) as usize).min(len - 1)
}

/// Resample intensities to `target` spacing.
pub fn resample_to_spacing(
    volume: &Volume<f32>,
    target: [f64; 3],
    mode: SampleMode,
) -> Result<Volume<f32>> {
    match mode {
        SampleMode::Nearest => resample_nearest(volume, target),
        SampleMode::Trilinear => {
            let plan = plan_spacing(&volume.geometry, target)?;
            let source = &volume.data;
            let [nx, ny, nz] = volume.shape();
            let mut out = Array3::<f32>::zeros((plan.shape[0], plan.shape[1], plan.shape[2]));

            Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
                let (x0, x1, fx) = linear_taps(source_coord(i, plan.scale[0]), nx);
                let (y0, y1, fy) = linear_taps(source_coord(j, plan.scale[1]), ny);
                let (z0, z1, fz) = linear_taps(source_coord(k, plan.scale[2]), nz);

                let lerp = |a: f32, b: f32, t: f32| a + (b - a) * t;
                let c00 = lerp(source[[x0, y0, z0]], source[[x1, y0, z0]], fx);
                let c10 = lerp(source[[x0, y1, z0]], source[[x1, y1, z0]], fx);
                let c01 = lerp(source[[x0, y0, z1]], source[[x1, y0, z1]], fx);
                let c11 = lerp(source[[x0, y1, z1]], source[[x1, y1, z1]], fx);
                let c0 = lerp(c00, c10, fy);
                let c1 = lerp(c01, c11, fy);
                *value = lerp(c0, c1, fz);
            });

            Ok(Volume::new(out, plan.affine))
        }
    }
}

/// Lower index, upper index and weight of the upper index, clamped to the grid.
#[inline]
fn linear_taps(coord: f64, len: usize) -> (usize, usize, f32) {
    let max = (len - 1) as f64;
    let coord = coord.clamp(0.0, max);
    let lower = coord.floor();
    let upper = (lower + 1.0).min(max);
    (lower as usize, upper as usize, (coord - lower) as f32)
}

/// Resample any voxel type to `target` spacing with nearest-neighbour lookup.
///
/// Never produces a value that is not present in the input.
pub fn resample_nearest<T>(volume: &Volume<T>, target: [f64; 3]) -> Result<Volume<T>>
where
    T: Copy + Default + Send + Sync,
{
    let plan = plan_spacing(&volume.geometry, target)?;
    let source = &volume.data;
    let [nx, ny, nz] = volume.shape();
    let mut out = Array3::<T>::default((plan.shape[0], plan.shape[1], plan.shape[2]));

    Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
        *value = source[[
            nearest_index(source_coord(i, plan.scale[0]), nx),
            nearest_index(source_coord(j, plan.scale[1]), ny),
            nearest_index(source_coord(k, plan.scale[2]), nz),
        ]];
    });

    Ok(Volume::new(out, plan.affine))
}

/// Resize to an exact grid shape with nearest-neighbour lookup
/// (`src = floor(dst * in / out)`).
pub fn resize_nearest<T>(volume: &Volume<T>, shape: [usize; 3]) -> Result<Volume<T>>
where
    T: Copy + Default + Send + Sync,
{
    if shape.contains(&0) {
        anyhow::bail!("Cannot resize to an empty grid {shape:?}");
    }
    check_grid(shape)?;
    let old = &volume.geometry;
    if old.shape == shape {
        return Ok(volume.clone());
    }

    let mut scale = [0.0; 3];
    let mut affine = old.affine;
    for axis in 0..3 {
        scale[axis] = old.shape[axis] as f64 / shape[axis] as f64;
        for row in 0..3 {
            affine[row][axis] *= scale[axis];
        }
    }

    let source = &volume.data;
    let lookup = |dst: usize, axis: usize| -> usize {
        ((dst as f64 * scale[axis]).floor() as usize).min(old.shape[axis] - 1)
    };
    let mut out = Array3::<T>::default((shape[0], shape[1], shape[2]));
    Zip::indexed(&mut out).par_for_each(|(i, j, k), value| {
        *value = source[[lookup(i, 0), lookup(j, 1), lookup(k, 2)]];
    });

    Ok(Volume::new(out, affine))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::IDENTITY;
    use std::collections::BTreeSet;

    fn scaled(spacing: [f64; 3]) -> Affine {
        let mut affine = IDENTITY;
        for axis in 0..3 {
            affine[axis][axis] = spacing[axis];
        }
        affine
    }

    fn labels() -> Volume<u8> {
        let data = Array3::from_shape_fn((6, 5, 4), |(i, j, k)| ((i + 2 * j + 3 * k) % 6) as u8);
        Volume::new(data, scaled([2.0, 2.0, 2.0]))
    }

    // =========================================================================
    // Spacing Plan Tests
    // =========================================================================

    mod plan {
        use super::*;

        #[test]
        fn shape_scales_with_spacing_ratio() {
            let geometry = Geometry::new(scaled([0.7, 0.7, 2.5]), [512, 512, 120]);
            let plan = plan_spacing(&geometry, [1.0, 1.0, 1.0]).unwrap();
            assert_eq!(plan.shape, [358, 358, 300]);
        }

        #[test]
        fn affine_reflects_new_spacing() {
            let geometry = Geometry::new(scaled([2.0, 2.0, 2.0]), [4, 4, 4]);
            let plan = plan_spacing(&geometry, [1.0, 1.0, 1.0]).unwrap();
            let spacing = Geometry::new(plan.affine, plan.shape).spacing();
            for value in spacing {
                assert!((value - 1.0).abs() < 1e-12);
            }
            // First output voxel sits 0.5 mm (a quarter of an input voxel) before the first input centre.
            assert!((plan.affine[0][3] + 0.5).abs() < 1e-12);
        }

        #[test]
        fn rejects_zero_target() {
            let geometry = Geometry::new(IDENTITY, [4, 4, 4]);
            assert!(plan_spacing(&geometry, [1.0, 0.0, 1.0]).is_err());
        }

        #[test]
        fn tiny_extent_keeps_one_voxel() {
            let geometry = Geometry::new(IDENTITY, [1, 1, 1]);
            let plan = plan_spacing(&geometry, [10.0, 10.0, 10.0]).unwrap();
            assert_eq!(plan.shape, [1, 1, 1]);
        }

        #[test]
        fn oversized_grid_is_an_error() {
            let geometry = Geometry::new(scaled([1e7, 1e7, 1e7]), [2, 2, 2]);
            let err = plan_spacing(&geometry, [1.0, 1.0, 1.0]).unwrap_err();
            assert!(err.to_string().contains("voxel limit"), "{err}");

            let geometry = Geometry::new(scaled([1000.0, 1000.0, 1000.0]), [2, 2, 2]);
            let err = plan_spacing(&geometry, [1.0, 1.0, 1.0]).unwrap_err();
            assert!(err.to_string().contains("voxel limit"), "{err}");
        }

        #[test]
        fn grid_check_catches_overflow() {
            assert!(check_grid([512, 512, 300]).is_ok());
            assert!(check_grid([usize::MAX, 2, 2]).is_err());
            assert!(check_grid([MAX_VOXELS, 2, 1]).is_err());
        }
    }

    // =========================================================================
    // Nearest-Neighbour Tests
    // =========================================================================

    mod nearest {
        use super::*;

        #[test]
        fn never_invents_label_values() {
            let volume = labels();
            let before: BTreeSet<u8> = volume.data.iter().copied().collect();
            for target in [[1.0, 1.0, 1.0], [3.0, 1.3, 0.7], [5.0, 5.0, 5.0]] {
                let resampled = resample_nearest(&volume, target).unwrap();
                let after: BTreeSet<u8> = resampled.data.iter().copied().collect();
                assert!(after.is_subset(&before), "{target:?} produced {after:?}");
            }
        }

        #[test]
        fn upsample_then_downsample_restores_labels() {
            let volume = labels();
            let fine = resample_nearest(&volume, [1.0, 1.0, 1.0]).unwrap();
            assert_eq!(fine.shape(), [12, 10, 8]);

            let coarse = resample_nearest(&fine, [2.0, 2.0, 2.0]).unwrap();
            assert_eq!(coarse.shape(), volume.shape());
            assert_eq!(coarse.data, volume.data);
        }

        #[test]
        fn resize_hits_exact_shape_without_new_values() {
            let volume = labels();
            let resized = resize_nearest(&volume, [7, 3, 9]).unwrap();
            assert_eq!(resized.shape(), [7, 3, 9]);

            let before: BTreeSet<u8> = volume.data.iter().copied().collect();
            assert!(resized.data.iter().all(|v| before.contains(v)));
            assert_eq!(resized.data[[0, 0, 0]], volume.data[[0, 0, 0]]);
        }

        #[test]
        fn resize_to_same_shape_is_identity() {
            let volume = labels();
            let resized = resize_nearest(&volume, volume.shape()).unwrap();
            assert_eq!(resized.data, volume.data);
        }

        #[test]
        fn resize_rejects_empty_grid() {
            assert!(resize_nearest(&labels(), [0, 3, 3]).is_err());
        }

        #[test]
        fn resize_rejects_oversized_grid() {
            assert!(resize_nearest(&labels(), [1 << 20, 1 << 20, 4]).is_err());
        }
    }

    // =========================================================================
    // Trilinear Tests
    // =========================================================================

    mod trilinear {
        use super::*;

        #[test]
        fn constant_volume_stays_constant() {
            let volume = Volume::new(Array3::from_elem((4, 4, 4), -850.0_f32), scaled([1.5, 1.5, 2.0]));
            let out = resample_to_spacing(&volume, [1.0, 1.0, 1.0], SampleMode::Trilinear).unwrap();
            assert_eq!(out.shape(), [6, 6, 8]);
            assert!(out.data.iter().all(|v| (v + 850.0).abs() < 1e-4));
        }

        #[test]
        fn ramp_is_interpolated_between_samples() {
            let data = Array3::from_shape_fn((4, 1, 1), |(i, _, _)| i as f32 * 10.0);
            let volume = Volume::new(data, scaled([2.0, 1.0, 1.0]));
            let out = resample_to_spacing(&volume, [1.0, 1.0, 1.0], SampleMode::Trilinear).unwrap();

            assert_eq!(out.shape(), [8, 1, 1]);
            // Output index 3 samples input coordinate 1.25.
            assert!((out.data[[3, 0, 0]] - 12.5).abs() < 1e-4);
            // Border samples are clamped, not extrapolated.
            assert!((out.data[[0, 0, 0]] - 0.0).abs() < 1e-4);
            assert!((out.data[[7, 0, 0]] - 30.0).abs() < 1e-4);
        }

        #[test]
        fn nearest_mode_matches_generic_nearest() {
            let data = Array3::from_shape_fn((5, 5, 5), |(i, j, k)| (i * j + k) as f32);
            let volume = Volume::new(data, IDENTITY);
            let a = resample_to_spacing(&volume, [0.6, 1.7, 1.0], SampleMode::Nearest).unwrap();
            let b = resample_nearest(&volume, [0.6, 1.7, 1.0]).unwrap();
            assert_eq!(a.data, b.data);
        }
    }
}
