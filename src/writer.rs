//! Writing label maps to NIfTI.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::{debug, warn};
use nifti::NiftiHeader;
use nifti::writer::WriterOptions;

use crate::config::EmphysemaEncoding;
use crate::postprocess::LabelMap;

/// Write `labels` as `uint8` with the geometry of `reference`.
///
/// Without emphysema the output is always 3D. With emphysema, `Channel`
/// writes a 4D `(X, Y, Z, 2)` volume and `Merged` a 3D volume.
pub fn write_label_map(
    path: &Path,
    reference: &NiftiHeader,
    labels: &LabelMap,
    encoding: EmphysemaEncoding,
) -> Result<()> {
    let mut header = reference.clone();
    // Labels are stored as-is.
    header.scl_slope = 1.0;
    header.scl_inter = 0.0;

    let options = WriterOptions::new(path).reference_header(&header);
    let written = match (&labels.emphysema, encoding) {
        (Some(_), EmphysemaEncoding::Channel) => options.write_nifti(&labels.stacked()),
        (Some(_), EmphysemaEncoding::Merged) => options.write_nifti(&labels.merged()),
        (None, _) => options.write_nifti(&labels.lobes),
    };
    written.with_context(|| format!("Failed to write label map: {path:?}"))?;

    debug!("Wrote {path:?}");
    Ok(())
}

/// A file that is removed when this guard goes out of scope.
#[derive(Debug)]
pub struct IntermediateFile {
    path: PathBuf,
}

impl IntermediateFile {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for IntermediateFile {
    fn drop(&mut self) {
        if !self.path.exists() {
            return;
        }
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to remove intermediate file {:?}: {e}", self.path);
        }
    }
}
