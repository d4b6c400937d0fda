//! NIfTI volume loading and voxel-to-world geometry.
//!
//! Arrays are indexed `(i, j, k)` in NIfTI voxel order, so `data[[i, j, k]]`
//! is the voxel whose world position is `affine * (i, j, k, 1)`.

use std::path::Path;

use anyhow::{Context, Result};
use ndarray::Array3;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};

use crate::transforms::orientation::AxCodes;

/// Homogeneous voxel-to-world transform, row major.
pub type Affine = [[f64; 4]; 4];

/// Identity affine (1 mm isotropic voxels at the origin).
pub const IDENTITY: Affine = [
    [1.0, 0.0, 0.0, 0.0],
    [0.0, 1.0, 0.0, 0.0],
    [0.0, 0.0, 1.0, 0.0],
    [0.0, 0.0, 0.0, 1.0],
];

/// Spatial metadata carried alongside every volume.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    pub affine: Affine,
    pub shape: [usize; 3],
}

impl Geometry {
    pub fn new(affine: Affine, shape: [usize; 3]) -> Self {
        Self { affine, shape }
    }

    /// Physical voxel size along each array axis (column norms of the affine).
    pub fn spacing(&self) -> [f64; 3] {
        let mut spacing = [0.0; 3];
        for (axis, value) in spacing.iter_mut().enumerate() {
            *value = (0..3)
                .map(|row| self.affine[row][axis].powi(2))
                .sum::<f64>()
                .sqrt();
        }
        spacing
    }

    /// Orientation codes such as `RAS` or `LPS`.
    pub fn axcodes(&self) -> AxCodes {
        AxCodes::from_affine(&self.affine)
    }

    /// World coordinate of voxel column `axis`, i.e. the step taken per index.
    pub fn column(&self, axis: usize) -> [f64; 3] {
        [
            self.affine[0][axis],
            self.affine[1][axis],
            self.affine[2][axis],
        ]
    }
}

/// A 3D array with its geometry.
#[derive(Debug, Clone)]
pub struct Volume<T> {
    pub data: Array3<T>,
    pub geometry: Geometry,
}

impl<T> Volume<T> {
    pub fn new(data: Array3<T>, affine: Affine) -> Self {
        let (x, y, z) = data.dim();
        Self {
            data,
            geometry: Geometry::new(affine, [x, y, z]),
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        self.geometry.shape
    }
}

/// A CT scan as read from disk: intensities in HU plus the source header.
///
/// The header is kept so outputs can be written with the same geometry.
#[derive(Debug, Clone)]
pub struct CtImage {
    // `NiftiHeader` is large; keep it off the stack while images move through channels.
    header: Box<NiftiHeader>,
    volume: Volume<f32>,
    zooms: [f64; 3],
}

impl CtImage {
    /// Read a `.nii` or `.nii.gz` file.
    ///
    /// Fails on unreadable files, non-3D data, and headers with zero or
    /// non-finite voxel sizes.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let obj = ReaderOptions::new()
            .read_file(path)
            .with_context(|| format!("Failed to read NIfTI file: {path:?}"))?;
        let header = Box::new(obj.header().clone());

        let rank = usize::from(header.dim[0]);
        if !(3..=7).contains(&rank) {
            anyhow::bail!("Expected a 3D volume, header declares {rank} dimensions");
        }
        if header.dim[4..=rank].iter().any(|&d| d > 1) {
            anyhow::bail!(
                "Expected a 3D volume, got extra dimensions {:?}",
                &header.dim[4..=rank]
            );
        }
        let shape = [
            usize::from(header.dim[1]),
            usize::from(header.dim[2]),
            usize::from(header.dim[3]),
        ];
        if shape.contains(&0) {
            anyhow::bail!("Volume has an empty dimension: {shape:?}");
        }

        let zooms = header_zooms(&header)?;
        let affine = header_affine(&header);
        if determinant3(&affine).abs() < f64::EPSILON {
            anyhow::bail!("Volume affine is singular: {affine:?}");
        }

        let data = obj
            .into_volume()
            .into_ndarray::<f32>()
            .with_context(|| format!("Failed to decode voxel data: {path:?}"))?;
        // Trailing singleton dimensions are dropped by reading in logical order.
        let data = data.as_standard_layout().into_owned();
        let data = Array3::from_shape_vec((shape[0], shape[1], shape[2]), data.into_raw_vec())
            .with_context(|| format!("Voxel data does not match header shape {shape:?}"))?;

        Ok(Self {
            header,
            volume: Volume::new(data, affine),
            zooms,
        })
    }

    pub fn header(&self) -> &NiftiHeader {
        &self.header
    }

    pub fn volume(&self) -> &Volume<f32> {
        &self.volume
    }

    pub fn geometry(&self) -> &Geometry {
        &self.volume.geometry
    }

    /// Voxel sizes as stored in `pixdim[1..=3]`.
    pub fn zooms(&self) -> [f64; 3] {
        self.zooms
    }
}

fn header_zooms(header: &NiftiHeader) -> Result<[f64; 3]> {
    let zooms = [
        f64::from(header.pixdim[1]).abs(),
        f64::from(header.pixdim[2]).abs(),
        f64::from(header.pixdim[3]).abs(),
    ];
    if zooms.iter().any(|z| !z.is_finite() || *z <= 0.0) {
        anyhow::bail!("Malformed header: invalid voxel spacing {zooms:?}");
    }
    Ok(zooms)
}

/// Best available affine: sform, then qform, then plain voxel scaling.
pub fn header_affine(header: &NiftiHeader) -> Affine {
    if header.sform_code > 0 {
        let row = |r: [f32; 4]| r.map(f64::from);
        return [
            row(header.srow_x),
            row(header.srow_y),
            row(header.srow_z),
            [0.0, 0.0, 0.0, 1.0],
        ];
    }

    let [_, dx, dy, dz, ..] = header.pixdim.map(|p| f64::from(p).abs());
    if header.qform_code > 0 {
        let (b, c, d) = (
            f64::from(header.quatern_b),
            f64::from(header.quatern_c),
            f64::from(header.quatern_d),
        );
        let a = (1.0 - (b * b + c * c + d * d)).max(0.0).sqrt();
        let qfac = if header.pixdim[0] < 0.0 { -1.0 } else { 1.0 };
        let rotation = [
            [
                a * a + b * b - c * c - d * d,
                2.0 * (b * c - a * d),
                2.0 * (b * d + a * c),
            ],
            [
                2.0 * (b * c + a * d),
                a * a + c * c - b * b - d * d,
                2.0 * (c * d - a * b),
            ],
            [
                2.0 * (b * d - a * c),
                2.0 * (c * d + a * b),
                a * a + d * d - b * b - c * c,
            ],
        ];
        let zooms = [dx, dy, dz * qfac];
        let offset = [
            f64::from(header.quatern_x),
            f64::from(header.quatern_y),
            f64::from(header.quatern_z),
        ];
        let mut affine = IDENTITY;
        for row in 0..3 {
            for col in 0..3 {
                affine[row][col] = rotation[row][col] * zooms[col];
            }
            affine[row][3] = offset[row];
        }
        return affine;
    }

    let mut affine = IDENTITY;
    affine[0][0] = dx;
    affine[1][1] = dy;
    affine[2][2] = dz;
    affine
}

fn determinant3(m: &Affine) -> f64 {
    m[0][0] * (m[1][1] * m[2][2] - m[1][2] * m[2][1])
        - m[0][1] * (m[1][0] * m[2][2] - m[1][2] * m[2][0])
        + m[0][2] * (m[1][0] * m[2][1] - m[1][1] * m[2][0])
}
