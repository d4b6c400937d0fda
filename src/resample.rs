//! Resampling a floating image onto a reference grid with an external tool.

use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result};
use log::debug;

/// Interpolation order understood by NiftyReg's `-inter` flag.
///
/// Only label maps are resampled, so nearest neighbour is the one order used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpolation {
    Nearest,
}

impl Interpolation {
    pub fn code(self) -> u8 {
        match self {
            Interpolation::Nearest => 0,
        }
    }
}

/// What the resampler reported once it ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResampleStatus {
    Completed,
    /// Exit code (`None` if killed by a signal) and captured stderr.
    Failed { code: Option<i32>, stderr: String },
}

/// Maps `floating` onto the grid of `reference` and writes `output`.
///
/// `Err` means the resampler could not be run at all.
pub trait ImageResampler {
    fn resample(
        &self,
        reference: &Path,
        floating: &Path,
        output: &Path,
        interpolation: Interpolation,
    ) -> Result<ResampleStatus>;
}

/// NiftyReg `reg_resample`.
#[derive(Debug, Clone)]
pub struct RegResample {
    binary: PathBuf,
}

impl RegResample {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn command(&self, reference: &Path, floating: &Path, output: &Path, interpolation: Interpolation) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("-ref")
            .arg(reference)
            .arg("-flo")
            .arg(floating)
            .arg("-res")
            .arg(output)
            .arg("-inter")
            .arg(interpolation.code().to_string());
        command
    }
}

impl ImageResampler for RegResample {
    fn resample(
        &self,
        reference: &Path,
        floating: &Path,
        output: &Path,
        interpolation: Interpolation,
    ) -> Result<ResampleStatus> {
        let mut command = self.command(reference, floating, output, interpolation);
        debug!("Running {command:?}");
        let result = command
            .output()
            .with_context(|| format!("Failed to execute {:?}. Is NiftyReg installed?", self.binary))?;

        if result.status.success() {
            return Ok(ResampleStatus::Completed);
        }
        Ok(ResampleStatus::Failed {
            code: result.status.code(),
            stderr: String::from_utf8_lossy(&result.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_interpolation_code() {
        assert_eq!(Interpolation::Nearest.code(), 0);
    }

    #[test]
    fn command_line_contract() {
        let tool = RegResample::new("/opt/niftyreg/bin/reg_resample");
        let command = tool.command(
            Path::new("/data/case.nii.gz"),
            Path::new("/seg/case_lobe.nii.gz"),
            Path::new("/seg/case.nii.gz"),
            Interpolation::Nearest,
        );

        assert_eq!(command.get_program(), "/opt/niftyreg/bin/reg_resample");
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            [
                "-ref",
                "/data/case.nii.gz",
                "-flo",
                "/seg/case_lobe.nii.gz",
                "-res",
                "/seg/case.nii.gz",
                "-inter",
                "0"
            ]
        );
    }

    #[test]
    fn missing_binary_is_an_error() {
        let tool = RegResample::new("/nonexistent/reg_resample");
        let result = tool.resample(
            Path::new("a.nii.gz"),
            Path::new("b.nii.gz"),
            Path::new("c.nii.gz"),
            Interpolation::Nearest,
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[test]
    fn exit_status_is_reported() {
        let paths = (Path::new("a.nii.gz"), Path::new("b.nii.gz"), Path::new("c.nii.gz"));

        let ok = RegResample::new("true")
            .resample(paths.0, paths.1, paths.2, Interpolation::Nearest)
            .unwrap();
        assert_eq!(ok, ResampleStatus::Completed);

        let failed = RegResample::new("false")
            .resample(paths.0, paths.1, paths.2, Interpolation::Nearest)
            .unwrap();
        assert!(matches!(failed, ResampleStatus::Failed { code: Some(1), .. }));
    }
}
