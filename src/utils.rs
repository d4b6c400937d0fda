//! Utility functions for path validation and case file discovery.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// Extension of compressed NIfTI volumes.
pub const NIFTI_GZ: &str = ".nii.gz";

/// Validate that the input folder exists and is a directory.
pub fn validate_input_folder(input: &Path) -> Result<()> {
    if !input.exists() {
        anyhow::bail!("Input folder does not exist: {input:?}");
    }
    if !input.is_dir() {
        anyhow::bail!("Input path is not a directory: {input:?}");
    }
    Ok(())
}

/// Create an output folder (and its parents) if it does not exist yet.
pub fn ensure_output_folder(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("Failed to create output folder: {path:?}"))
}

/// Case identifier of a volume: its file name without `.nii.gz`.
///
/// Returns `None` for anything that is not a `.nii.gz` file name.
pub fn case_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_suffix(NIFTI_GZ)?;
    (!id.is_empty()).then(|| id.to_string())
}

/// All `*.nii.gz` files directly inside `dir`, sorted by name.
pub fn list_volumes(dir: &Path) -> Result<Vec<PathBuf>> {
    validate_input_folder(dir)?;
    let mut volumes = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read directory: {dir:?}"))? {
        let path = entry
            .with_context(|| format!("Failed to read entry in {dir:?}"))?
            .path();
        if path.is_file() && case_id(&path).is_some() {
            volumes.push(path);
        }
    }
    volumes.sort();
    Ok(volumes)
}

// =============================================================================
// Unit Tests for utils module
// =============================================================================
