//! From network logits to a clean lobe label map on the native grid.

use std::ops::RangeInclusive;

use anyhow::{Context, Result};
use log::debug;
use ndarray::{Array3, Array4, ArrayView4, Axis, Zip};

use crate::morphology::{Connectivity, largest_component, nearest_feature, unravel};
use crate::transforms::{reorient, resample_nearest, resize_nearest};
use crate::volume::{CtImage, Geometry, Volume};

/// Background plus five lobes.
pub const NUM_CLASSES: usize = 6;

pub const LOBE_LABELS: RangeInclusive<u8> = 1..=5;

/// Value emphysema voxels take in a merged label map.
pub const EMPHYSEMA_LABEL: u8 = 7;

/// Class index with the highest logit per voxel; ties go to the lowest index.
pub fn argmax_classes(logits: ArrayView4<'_, f32>) -> Result<Array3<u8>> {
    let (classes, x, y, z) = logits.dim();
    if classes == 0 || classes > usize::from(u8::MAX) + 1 {
        anyhow::bail!("Cannot take arg-max over {classes} classes");
    }

    let mut labels = Array3::<u8>::zeros((x, y, z));
    Zip::from(&mut labels)
        .and(logits.lanes(Axis(0)))
        .par_for_each(|label, lane| {
            let mut best = 0;
            for (class, &value) in lane.iter().enumerate().skip(1) {
                if value > lane[best] {
                    best = class;
                }
            }
            *label = best as u8;
        });
    Ok(labels)
}

/// Keep only the largest 26-connected component of every lobe label.
///
/// Labels absent from the input stay absent; background is untouched.
pub fn largest_component_per_label(labels: &Array3<u8>) -> Array3<u8> {
    let mut retained = Array3::<u8>::zeros(labels.dim());
    for label in LOBE_LABELS {
        let mask = labels.mapv(|v| v == label);
        let keep = largest_component(&mask, Connectivity::Full);
        Zip::from(&mut retained).and(&keep).for_each(|out, &k| {
            if k {
                *out = label;
            }
        });
    }
    retained
}

/// Give every voxel that was labelled in `original` but lost its label in
/// `retained` the label of the nearest retained voxel.
///
/// Background stays background, so the set of labelled voxels is unchanged.
pub fn nearest_label_fill(original: &Array3<u8>, retained: &Array3<u8>) -> Array3<u8> {
    let mut filled = retained.clone();
    let holes = Zip::from(original)
        .and(retained)
        .map_collect(|&o, &r| o != 0 && r == 0);
    if !holes.iter().any(|&h| h) {
        return filled;
    }

    let Some(nearest) = nearest_feature(&retained.mapv(|v| v != 0)) else {
        return filled;
    };
    let dims = retained.dim();
    Zip::from(&mut filled)
        .and(&holes)
        .and(&nearest)
        .for_each(|value, &hole, &source| {
            if hole {
                *value = retained[unravel(source, dims)];
            }
        });
    filled
}

/// Voxels below `threshold` HU inside the lobes.
pub fn emphysema_mask(intensity: &Array3<f32>, lobes: &Array3<u8>, threshold: f32) -> Array3<bool> {
    Zip::from(intensity)
        .and(lobes)
        .map_collect(|&hu, &label| label != 0 && hu < threshold)
}

/// Final per-case segmentation on the native grid.
#[derive(Debug, Clone)]
pub struct LabelMap {
    pub lobes: Array3<u8>,
    pub emphysema: Option<Array3<bool>>,
}

impl LabelMap {
    /// Lobe labels with emphysema voxels set to [`EMPHYSEMA_LABEL`].
    pub fn merged(&self) -> Array3<u8> {
        let mut merged = self.lobes.clone();
        if let Some(emphysema) = &self.emphysema {
            Zip::from(&mut merged).and(emphysema).for_each(|label, &emp| {
                if emp {
                    *label = EMPHYSEMA_LABEL;
                }
            });
        }
        merged
    }

    /// `(X, Y, Z, 2)`: lobes in channel 0, emphysema as 0/1 in channel 1.
    pub fn stacked(&self) -> Array4<u8> {
        let (x, y, z) = self.lobes.dim();
        let mut stacked = Array4::<u8>::zeros((x, y, z, 2));
        stacked.index_axis_mut(Axis(3), 0).assign(&self.lobes);
        if let Some(emphysema) = &self.emphysema {
            stacked
                .index_axis_mut(Axis(3), 1)
                .assign(&emphysema.mapv(u8::from));
        }
        stacked
    }
}

/// Map `(classes, X, Y, Z)` logits on the working grid back onto `image`.
pub fn postprocess(
    logits: &Array4<f32>,
    working: &Geometry,
    image: &CtImage,
    emp_threshold: Option<f32>,
) -> Result<LabelMap> {
    let (classes, x, y, z) = logits.dim();
    if classes != NUM_CLASSES {
        anyhow::bail!("Expected {NUM_CLASSES} output classes, got {classes}");
    }
    if [x, y, z] != working.shape {
        anyhow::bail!(
            "Logits grid {:?} does not match working grid {:?}",
            [x, y, z],
            working.shape
        );
    }

    let labels = argmax_classes(logits.view())?;
    let labels = Volume {
        data: labels,
        geometry: working.clone(),
    };

    let native = image.geometry();
    let reoriented = reorient(&labels, native.axcodes()).context("Failed to restore orientation")?;
    let resampled = resample_nearest(&reoriented, image.zooms()).context("Failed to restore spacing")?;
    let resized = resize_nearest(&resampled, native.shape).context("Failed to restore grid")?;
    debug!(
        "Labels {:?} -> {:?} -> {:?}",
        working.shape,
        resampled.shape(),
        resized.shape()
    );

    let retained = largest_component_per_label(&resized.data);
    let lobes = nearest_label_fill(&resized.data, &retained);
    let emphysema = emp_threshold.map(|threshold| emphysema_mask(&image.volume().data, &lobes, threshold));

    Ok(LabelMap { lobes, emphysema })
}
