//! Patch-based inference over whole volumes.

use anyhow::Result;
use log::debug;
use ndarray::{Array3, Array4, Array5, ArrayView4, Axis, s};

use crate::config::Config;
use crate::model::SegmentationModel;

/// Strategy that turns a `(C, X, Y, Z)` image into `(classes, X, Y, Z)` logits.
pub trait Inferer {
    fn infer(&self, input: ArrayView4<'_, f32>, model: &dyn SegmentationModel) -> Result<Array4<f32>>;
}

/// Constant-overlap sliding window with uniform averaging.
///
/// Inputs smaller than the window are zero-padded symmetrically and the
/// padding is cropped from the result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SlidingWindow {
    pub roi: [usize; 3],
    pub batch: usize,
    pub overlap: f64,
}

impl SlidingWindow {
    pub fn new(roi: [usize; 3], batch: usize, overlap: f64) -> Self {
        Self {
            roi,
            batch: batch.max(1),
            overlap,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.roi_size, config.sw_batch_size, config.overlap)
    }

    /// Lower corners of every window over a grid of `size` (already at least `roi`).
    fn corners(&self, size: [usize; 3]) -> Vec<[usize; 3]> {
        let starts: Vec<Vec<usize>> = (0..3)
            .map(|axis| {
                let interval = scan_interval(self.roi[axis], size[axis], self.overlap);
                window_starts(size[axis], self.roi[axis], interval)
            })
            .collect();

        let mut corners = Vec::with_capacity(starts.iter().map(Vec::len).product());
        for &x in &starts[0] {
            for &y in &starts[1] {
                for &z in &starts[2] {
                    corners.push([x, y, z]);
                }
            }
        }
        corners
    }
}

fn scan_interval(roi: usize, size: usize, overlap: f64) -> usize {
    if roi == size {
        return roi;
    }
    ((roi as f64 * (1.0 - overlap)) as usize).max(1)
}

fn window_starts(size: usize, roi: usize, interval: usize) -> Vec<usize> {
    let span = size - roi;
    let count = span.div_ceil(interval) + 1;
    (0..count).map(|d| (d * interval).min(span)).collect()
}

impl Inferer for SlidingWindow {
    fn infer(&self, input: ArrayView4<'_, f32>, model: &dyn SegmentationModel) -> Result<Array4<f32>> {
        let (channels, x, y, z) = input.dim();
        if [channels, x, y, z].contains(&0) {
            anyhow::bail!("Cannot run inference on an empty image {:?}", input.dim());
        }
        let size = [x, y, z];
        let [rx, ry, rz] = self.roi;

        let mut padded_size = [0; 3];
        let mut before = [0; 3];
        for axis in 0..3 {
            padded_size[axis] = size[axis].max(self.roi[axis]);
            before[axis] = (padded_size[axis] - size[axis]) / 2;
        }
        let [px, py, pz] = padded_size;
        let [bx, by, bz] = before;
        let mut padded = Array4::<f32>::zeros((channels, px, py, pz));
        padded
            .slice_mut(s![.., bx..bx + x, by..by + y, bz..bz + z])
            .assign(&input);

        let corners = self.corners(padded_size);
        debug!(
            "Sliding window: {} patches of {:?} over {:?}, batch {}",
            corners.len(),
            self.roi,
            padded_size,
            self.batch
        );

        let classes = model.num_classes();
        let mut sum = Array4::<f32>::zeros((classes, px, py, pz));
        let mut count = Array3::<f32>::zeros((px, py, pz));

        for chunk in corners.chunks(self.batch) {
            let mut patches = Array5::<f32>::zeros((chunk.len(), channels, rx, ry, rz));
            for (n, &[cx, cy, cz]) in chunk.iter().enumerate() {
                patches
                    .index_axis_mut(Axis(0), n)
                    .assign(&padded.slice(s![.., cx..cx + rx, cy..cy + ry, cz..cz + rz]));
            }

            let logits = model.predict(patches.view())?;
            if logits.dim() != (chunk.len(), classes, rx, ry, rz) {
                anyhow::bail!(
                    "Model returned logits of shape {:?}, expected {:?}",
                    logits.dim(),
                    (chunk.len(), classes, rx, ry, rz)
                );
            }

            for (n, &[cx, cy, cz]) in chunk.iter().enumerate() {
                let mut target = sum.slice_mut(s![.., cx..cx + rx, cy..cy + ry, cz..cz + rz]);
                target += &logits.index_axis(Axis(0), n);
                count
                    .slice_mut(s![cx..cx + rx, cy..cy + ry, cz..cz + rz])
                    .mapv_inplace(|c| c + 1.0);
            }
        }

        for mut channel in sum.outer_iter_mut() {
            channel /= &count;
        }

        Ok(sum
            .slice(s![.., bx..bx + x, by..by + y, bz..bz + z])
            .to_owned())
    }
}
