//! Intensity windowing.

use ndarray::Array3;

/// CT display window `[lower, upper]` in HU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Window {
    pub lower: f32,
    pub upper: f32,
}

impl Window {
    pub fn new(lower: f32, upper: f32) -> Self {
        Self { lower, upper }
    }

    /// Map `value` linearly onto `[0, 1]`, clipping outside the window.
    #[inline]
    pub fn normalize(&self, value: f32) -> f32 {
        ((value - self.lower) / (self.upper - self.lower)).clamp(0.0, 1.0)
    }
}

/// Window every voxel in place.
pub fn scale_intensity_range(data: &mut Array3<f32>, window: Window) {
    data.par_mapv_inplace(|v| window.normalize(v));
}
