//! Turning a CT scan into the network's input tensor.

use anyhow::Result;
use log::debug;
use ndarray::{Array4, Axis};

use crate::config::Config;
use crate::transforms::body_mask::apply_body_mask;
use crate::transforms::intensity::{Window, scale_intensity_range};
use crate::transforms::{AxCodes, SampleMode, reorient, resample_to_spacing};
use crate::volume::{Geometry, Volume};

/// Network input plus the geometry of the working grid it lives on.
#[derive(Debug, Clone)]
pub struct PreparedVolume {
    /// `(1, X, Y, Z)`, RAS, windowed to `[0, 1]`.
    pub tensor: Array4<f32>,
    pub geometry: Geometry,
}

#[derive(Debug, Clone, Copy)]
pub struct Preprocessor {
    pub pix_dim: [f64; 3],
    pub window: Window,
    pub body_threshold: f32,
}

impl Preprocessor {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pix_dim: config.pix_dim,
            window: config.intensity_window(),
            body_threshold: config.body_threshold,
        }
    }

    /// Resample, reorient to RAS, mask the body, window and add the channel axis.
    pub fn prepare(&self, volume: &Volume<f32>) -> Result<PreparedVolume> {
        let resampled = resample_to_spacing(volume, self.pix_dim, SampleMode::Trilinear)?;
        let Volume { mut data, geometry } = reorient(&resampled, AxCodes::RAS)?;
        debug!(
            "Working grid {:?} at {:?} mm (native {:?}, {})",
            geometry.shape,
            self.pix_dim,
            volume.shape(),
            volume.geometry.axcodes()
        );

        // Outside the body becomes the window floor, i.e. 0 after scaling.
        apply_body_mask(&mut data, self.body_threshold, self.window.lower);
        scale_intensity_range(&mut data, self.window);

        Ok(PreparedVolume {
            tensor: data.insert_axis(Axis(0)),
            geometry,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    fn preprocessor() -> Preprocessor {
        Preprocessor {
            pix_dim: [1.0, 1.0, 1.0],
            window: Window::new(-1000.0, 500.0),
            body_threshold: -500.0,
        }
    }

    /// LPS chest phantom at 2 mm: body shell with air-filled lungs and a table.
    fn chest() -> Volume<f32> {
        let data = Array3::from_shape_fn((12, 12, 6), |(i, j, _)| {
            let body = (1..9).contains(&i) && (1..11).contains(&j);
            let lung = (3..7).contains(&i) && (3..9).contains(&j);
            let table = i == 11;
            if lung {
                -850.0
            } else if body || table {
                40.0
            } else {
                -1000.0
            }
        });
        let affine = [
            [-2.0, 0.0, 0.0, 0.0],
            [0.0, -2.0, 0.0, 0.0],
            [0.0, 0.0, 2.0, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        Volume::new(data, affine)
    }

    #[test]
    fn output_is_ras_on_target_grid_with_channel_axis() {
        let prepared = preprocessor().prepare(&chest()).unwrap();
        assert_eq!(prepared.tensor.dim(), (1, 24, 24, 12));
        assert_eq!(prepared.geometry.shape, [24, 24, 12]);
        assert_eq!(prepared.geometry.axcodes(), AxCodes::RAS);
        for value in prepared.geometry.spacing() {
            assert!((value - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn values_are_windowed_to_unit_range() {
        let prepared = preprocessor().prepare(&chest()).unwrap();
        assert!(prepared.tensor.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn outside_body_is_zero_and_lungs_survive() {
        let prepared = preprocessor().prepare(&chest()).unwrap();
        let lung = Window::new(-1000.0, 500.0).normalize(-850.0);

        // After the LPS to RAS flip, native i = 11 (table) lands on the low x edge.
        assert_eq!(prepared.tensor[[0, 0, 12, 6]], 0.0);
        assert_eq!(prepared.tensor[[0, 23, 23, 6]], 0.0);
        // Native lung voxel (i = 5, j = 6) resamples to (10, 12), flipped to (13, 11).
        assert!((prepared.tensor[[0, 13, 11, 6]] - lung).abs() < 1e-6);
    }

    #[test]
    fn is_deterministic() {
        let a = preprocessor().prepare(&chest()).unwrap();
        let b = preprocessor().prepare(&chest()).unwrap();
        assert_eq!(a.tensor, b.tensor);
        assert_eq!(a.geometry, b.geometry);
    }
}
