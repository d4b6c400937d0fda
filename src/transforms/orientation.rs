//! Axis orientation codes and reorientation of volumes.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use ndarray::Axis;

use crate::volume::{Affine, Volume};

/// Labels for the negative and positive direction of each world axis.
const LABELS: [(char, char); 3] = [('L', 'R'), ('P', 'A'), ('I', 'S')];

/// Which world axis an array axis runs along, and in which direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisCode {
    pub world: usize,
    pub positive: bool,
}

impl AxisCode {
    fn letter(self) -> char {
        let (negative, positive) = LABELS[self.world];
        if self.positive { positive } else { negative }
    }
}

/// Orientation of the three array axes, e.g. `RAS`.
///
/// Every world axis appears exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxCodes([AxisCode; 3]);

impl AxCodes {
    pub const RAS: Self = Self([
        AxisCode {
            world: 0,
            positive: true,
        },
        AxisCode {
            world: 1,
            positive: true,
        },
        AxisCode {
            world: 2,
            positive: true,
        },
    ]);

    pub fn codes(&self) -> [AxisCode; 3] {
        self.0
    }

    /// Nearest orthogonal orientation of an affine.
    ///
    /// Array axes are matched to world axes greedily, largest direction
    /// cosine first, so oblique scans still get a unique assignment.
    pub fn from_affine(affine: &Affine) -> Self {
        let mut candidates = Vec::with_capacity(9);
        for world in 0..3 {
            for axis in 0..3 {
                candidates.push((affine[world][axis], world, axis));
            }
        }
        candidates.sort_by(|a, b| b.0.abs().total_cmp(&a.0.abs()));

        let mut codes = Self::RAS.0;
        let mut world_used = [false; 3];
        let mut axis_used = [false; 3];
        for (value, world, axis) in candidates {
            if world_used[world] || axis_used[axis] {
                continue;
            }
            world_used[world] = true;
            axis_used[axis] = true;
            codes[axis] = AxisCode {
                world,
                positive: value >= 0.0,
            };
        }
        Self(codes)
    }

    fn axis_of_world(&self, world: usize) -> Option<usize> {
        self.0.iter().position(|code| code.world == world)
    }
}

impl fmt::Display for AxCodes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for code in self.0 {
            write!(f, "{}", code.letter())?;
        }
        Ok(())
    }
}

impl FromStr for AxCodes {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let letters: Vec<char> = s.trim().to_ascii_uppercase().chars().collect();
        if letters.len() != 3 {
            anyhow::bail!("Orientation codes need exactly 3 letters, got {s:?}");
        }

        let mut codes = Self::RAS.0;
        let mut seen = [false; 3];
        for (axis, letter) in letters.into_iter().enumerate() {
            let (world, positive) = LABELS
                .iter()
                .enumerate()
                .find_map(|(world, &(neg, pos))| match letter {
                    l if l == pos => Some((world, true)),
                    l if l == neg => Some((world, false)),
                    _ => None,
                })
                .with_context(|| format!("Unknown orientation letter {letter:?} in {s:?}"))?;
            if seen[world] {
                anyhow::bail!("Orientation {s:?} names the same world axis twice");
            }
            seen[world] = true;
            codes[axis] = AxisCode { world, positive };
        }
        Ok(Self(codes))
    }
}

/// Permute and flip array axes so the volume has orientation `target`.
///
/// Voxel values are not interpolated; the affine is updated so every voxel
/// keeps its world position.
pub fn reorient<T: Clone>(volume: &Volume<T>, target: AxCodes) -> Result<Volume<T>> {
    let source = volume.geometry.axcodes();
    if source == target {
        return Ok(volume.clone());
    }

    let mut perm = [0usize; 3];
    let mut flip = [false; 3];
    for (axis, code) in target.codes().iter().enumerate() {
        let from = source
            .axis_of_world(code.world)
            .with_context(|| format!("Cannot map {source} onto {target}"))?;
        perm[axis] = from;
        flip[axis] = source.codes()[from].positive != code.positive;
    }

    let mut view = volume.data.view().permuted_axes(perm);
    for (axis, &flipped) in flip.iter().enumerate() {
        if flipped {
            view.invert_axis(Axis(axis));
        }
    }
    let data = view.as_standard_layout().into_owned();

    let old = &volume.geometry;
    let mut affine = old.affine;
    for (axis, (&from, &flipped)) in perm.iter().zip(flip.iter()).enumerate() {
        let column = old.column(from);
        let sign = if flipped { -1.0 } else { 1.0 };
        for row in 0..3 {
            affine[row][axis] = sign * column[row];
        }
        if flipped {
            let extent = (old.shape[from] - 1) as f64;
            for row in 0..3 {
                affine[row][3] += column[row] * extent;
            }
        }
    }

    Ok(Volume::new(data, affine))
}
