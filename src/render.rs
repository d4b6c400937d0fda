//! Overlay renderings of label maps on the CT, one PNG per anatomical plane.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, Axis};

use crate::transforms::intensity::Window;
use crate::transforms::{AxCodes, reorient};
use crate::volume::{CtImage, Volume};

/// Label colours, indexed by label value.
const PALETTE: [[u8; 3]; 8] = [
    [0, 0, 0],
    [230, 25, 75],
    [60, 180, 75],
    [255, 225, 25],
    [0, 130, 200],
    [245, 130, 48],
    [145, 30, 180],
    [70, 240, 240],
];

const LABEL_ALPHA: f32 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Plane {
    Coronal,
    Axial,
    Sagittal,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Coronal, Plane::Axial, Plane::Sagittal];

    /// RAS axis held fixed, and the axes drawn as columns and rows.
    fn axes(self) -> (usize, usize, usize) {
        match self {
            Plane::Coronal => (1, 0, 2),
            Plane::Axial => (2, 0, 1),
            Plane::Sagittal => (0, 1, 2),
        }
    }
}

impl fmt::Display for Plane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Plane::Coronal => "coronal",
            Plane::Axial => "axial",
            Plane::Sagittal => "sagittal",
        };
        f.write_str(name)
    }
}

/// Central slice of a RAS volume with labels blended on top.
///
/// Rows run from superior (or anterior, for axial) at the top; the image is
/// stretched so pixels are square in millimetres.
pub fn render_plane(intensity: &Volume<f32>, labels: &Array3<u8>, plane: Plane, window: Window) -> Result<RgbImage> {
    if intensity.data.dim() != labels.dim() {
        anyhow::bail!(
            "Label grid {:?} does not match image grid {:?}",
            labels.dim(),
            intensity.data.dim()
        );
    }
    let (fixed, col_axis, row_axis) = plane.axes();
    let centre = intensity.shape()[fixed] / 2;
    // Removing the fixed axis leaves `(col, row)` order.
    let gray = intensity.data.index_axis(Axis(fixed), centre);
    let label = labels.index_axis(Axis(fixed), centre);

    let (cols, rows) = gray.dim();
    let width = u32::try_from(cols).context("Slice too wide")?;
    let height = u32::try_from(rows).context("Slice too tall")?;
    let image = RgbImage::from_fn(width, height, |x, y| {
        let col = x as usize;
        // Top row is the highest index along the row axis.
        let row = rows - 1 - y as usize;
        let level = window.normalize(gray[[col, row]]) * 255.0;
        let base = [level; 3];
        let value = label[[col, row]];
        let pixel = if value == 0 {
            base
        } else {
            let colour = PALETTE[usize::from(value) % PALETTE.len()];
            [0, 1, 2].map(|c| base[c] * (1.0 - LABEL_ALPHA) + f32::from(colour[c]) * LABEL_ALPHA)
        };
        Rgb(pixel.map(|v| v.round().clamp(0.0, 255.0) as u8))
    });

    let spacing = intensity.geometry.spacing();
    let aspect = spacing[row_axis] / spacing[col_axis];
    let scaled_height = ((f64::from(height) * aspect).round() as u32).max(1);
    if scaled_height == height {
        return Ok(image);
    }
    Ok(imageops::resize(&image, width, scaled_height, FilterType::Nearest))
}

/// Render all planes of `image` with `labels` and save them as
/// `{dir}/{case_id}_{plane}.png`.
pub fn save_overlays(
    dir: &Path,
    case_id: &str,
    image: &CtImage,
    labels: &Array3<u8>,
    window: Window,
) -> Result<Vec<PathBuf>> {
    let intensity = reorient(image.volume(), AxCodes::RAS)?;
    let labels = reorient(
        &Volume::new(labels.clone(), image.geometry().affine),
        AxCodes::RAS,
    )?;

    let mut written = Vec::with_capacity(Plane::ALL.len());
    for plane in Plane::ALL {
        let overlay = render_plane(&intensity, &labels.data, plane, window)?;
        let path = dir.join(format!("{case_id}_{plane}.png"));
        overlay
            .save_with_format(&path, ImageFormat::Png)
            .with_context(|| format!("Failed to save overlay: {path:?}"))?;
        written.push(path);
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::volume::IDENTITY;
    use crate::volume::test_support::write_scan;
    use tempfile::TempDir;

    fn window() -> Window {
        Window::new(-1000.0, 0.0)
    }

    fn anisotropic(shape: (usize, usize, usize), spacing: [f64; 3]) -> Volume<f32> {
        let mut affine = IDENTITY;
        for axis in 0..3 {
            affine[axis][axis] = spacing[axis];
        }
        Volume::new(Array3::from_elem(shape, -500.0), affine)
    }

    // =========================================================================
    // Plane Rendering Tests
    // =========================================================================

    mod planes {
        use super::*;

        #[test]
        fn plane_names() {
            let names: Vec<String> = Plane::ALL.iter().map(|p| p.to_string()).collect();
            assert_eq!(names, ["coronal", "axial", "sagittal"]);
        }

        #[test]
        fn dimensions_follow_plane_axes() {
            let volume = anisotropic((8, 6, 4), [1.0, 1.0, 1.0]);
            let labels = Array3::zeros((8, 6, 4));

            let coronal = render_plane(&volume, &labels, Plane::Coronal, window()).unwrap();
            assert_eq!(coronal.dimensions(), (8, 4));
            let axial = render_plane(&volume, &labels, Plane::Axial, window()).unwrap();
            assert_eq!(axial.dimensions(), (8, 6));
            let sagittal = render_plane(&volume, &labels, Plane::Sagittal, window()).unwrap();
            assert_eq!(sagittal.dimensions(), (6, 4));
        }

        #[test]
        fn thick_slices_are_stretched() {
            let volume = anisotropic((8, 6, 4), [0.5, 0.5, 2.0]);
            let labels = Array3::zeros((8, 6, 4));
            let coronal = render_plane(&volume, &labels, Plane::Coronal, window()).unwrap();
            assert_eq!(coronal.dimensions(), (8, 16));
        }

        #[test]
        fn labels_are_tinted_and_background_is_gray() {
            let volume = anisotropic((4, 4, 4), [1.0, 1.0, 1.0]);
            let mut labels = Array3::zeros((4, 4, 4));
            // Superior-most voxel of the central coronal slice, at column 0.
            labels[[0, 2, 3]] = 1u8;

            let coronal = render_plane(&volume, &labels, Plane::Coronal, window()).unwrap();
            let Rgb([r, g, b]) = *coronal.get_pixel(0, 0);
            assert!(r > g && r > b, "label pixel should be tinted, got {:?}", [r, g, b]);

            let Rgb(gray) = *coronal.get_pixel(1, 0);
            assert_eq!(gray, [128, 128, 128]);
        }

        #[test]
        fn mismatched_labels_are_rejected() {
            let volume = anisotropic((4, 4, 4), [1.0, 1.0, 1.0]);
            let labels = Array3::zeros((4, 4, 3));
            assert!(render_plane(&volume, &labels, Plane::Axial, window()).is_err());
        }
    }

    // =========================================================================
    // Overlay File Tests
    // =========================================================================

    mod files {
        use super::*;

        #[test]
        fn writes_one_png_per_plane() {
            let temp_dir = TempDir::new().unwrap();
            let scan_path = temp_dir.path().join("scan.nii.gz");
            let data = Array3::from_elem((6, 5, 4), -700.0_f32);
            write_scan(&scan_path, &data, &IDENTITY);
            let image = CtImage::open(&scan_path).unwrap();
            let labels = Array3::from_elem((6, 5, 4), 2u8);

            let written = save_overlays(temp_dir.path(), "case01", &image, &labels, window()).unwrap();
            let names: Vec<String> = written
                .iter()
                .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
                .collect();
            assert_eq!(names, ["case01_coronal.png", "case01_axial.png", "case01_sagittal.png"]);
            for path in &written {
                let png = image::open(path).unwrap();
                assert!(png.width() > 0 && png.height() > 0);
            }
        }
    }
}
