//! Coarse body mask for chest CT.
//!
//! Tissue denser than a threshold is taken as body, reduced to its largest
//! face-connected component, then closed slice by slice along the axial axis
//! so the air-filled lungs count as inside.

use log::warn;
use ndarray::{Array3, Axis, Zip};

use crate::morphology::{Connectivity, fill_holes_per_slice, largest_component};

/// HU above which a voxel is considered body tissue.
pub const DEFAULT_BODY_THRESHOLD: f32 = -500.0;

/// Body mask of a RAS-oriented volume (axis 2 is the axial direction).
pub fn body_mask(data: &Array3<f32>, threshold: f32) -> Array3<bool> {
    let dense = data.mapv(|v| v > threshold);
    let mut body = largest_component(&dense, Connectivity::Face);
    fill_holes_per_slice(&mut body, Axis(2));
    body
}

/// Replace every voxel outside the body with `fill`.
///
/// Returns the number of voxels inside the body. A scan with no voxel above
/// the threshold is left untouched.
pub fn apply_body_mask(data: &mut Array3<f32>, threshold: f32, fill: f32) -> usize {
    let mask = body_mask(data, threshold);
    let inside = mask.iter().filter(|v| **v).count();
    if inside == 0 {
        warn!("Body mask is empty at threshold {threshold} HU; keeping the full field of view");
        return 0;
    }

    Zip::from(data).and(&mask).for_each(|value, &keep| {
        if !keep {
            *value = fill;
        }
    });
    inside
}
