//! Run configuration loaded from a YAML file.
//!
//! ```yaml
//! data_dir: /data/T0/nifti
//! model_path: /models/lobe_unet.onnx
//! seg_dir: /data/T0/seg
//! clip_dir: /data/T0/clip
//! pix_dim: [1.0, 1.0, 1.0]
//! window: [-1000, 500]
//! num_workers: 2
//! reg_resample: /opt/niftyreg/bin/reg_resample
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::transforms::body_mask::DEFAULT_BODY_THRESHOLD;
use crate::transforms::intensity::Window;

/// Config file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "config.YAML";

/// How the emphysema mask is stored next to the lobe labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmphysemaEncoding {
    /// 4D output: lobes in channel 0, emphysema (0/1) in channel 1.
    Channel,
    /// 3D output: emphysema voxels take label 7.
    Merged,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Folder of input `*.nii.gz` scans.
    pub data_dir: PathBuf,
    /// ONNX export of the lobe segmentation network.
    pub model_path: PathBuf,
    /// Folder for the final label maps.
    pub seg_dir: PathBuf,
    /// Folder for overlay renderings.
    pub clip_dir: PathBuf,
    /// Working voxel spacing in mm.
    pub pix_dim: [f64; 3],
    /// Intensity window `[a_min, a_max]` in HU.
    pub window: [f32; 2],
    /// Depth of the background prefetch queue; 0 loads inline.
    pub num_workers: usize,
    /// Path to NiftyReg's `reg_resample`.
    pub reg_resample: PathBuf,

    #[serde(default = "default_roi_size")]
    pub roi_size: [usize; 3],
    #[serde(default = "default_sw_batch_size")]
    pub sw_batch_size: usize,
    #[serde(default = "default_overlap")]
    pub overlap: f64,
    #[serde(default = "default_body_threshold")]
    pub body_threshold: f32,
    #[serde(default = "default_emp_threshold")]
    pub emp_threshold: f32,
    #[serde(default = "default_emp_encoding")]
    pub emp_encoding: EmphysemaEncoding,
    #[serde(default = "default_vis_range")]
    pub vis_range: [f32; 2],
    #[serde(default = "default_open_files")]
    pub open_files: u64,
}

fn default_roi_size() -> [usize; 3] {
    [96, 96, 96]
}

fn default_sw_batch_size() -> usize {
    4
}

fn default_overlap() -> f64 {
    0.25
}

fn default_body_threshold() -> f32 {
    DEFAULT_BODY_THRESHOLD
}

fn default_emp_threshold() -> f32 {
    -950.0
}

fn default_emp_encoding() -> EmphysemaEncoding {
    EmphysemaEncoding::Channel
}

fn default_vis_range() -> [f32; 2] {
    [-1000.0, 0.0]
}

fn default_open_files() -> u64 {
    4096
}

impl Config {
    /// Read and validate a YAML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path:?}"))?;
        Self::from_yaml(&text).with_context(|| format!("Invalid config file: {path:?}"))
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text).context("Failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.pix_dim.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            anyhow::bail!("pix_dim must be three positive numbers, got {:?}", self.pix_dim);
        }
        let [a_min, a_max] = self.window;
        if !(a_min.is_finite() && a_max.is_finite() && a_min < a_max) {
            anyhow::bail!("window must satisfy a_min < a_max, got {:?}", self.window);
        }
        let [v_min, v_max] = self.vis_range;
        if !(v_min < v_max) {
            anyhow::bail!("vis_range must satisfy min < max, got {:?}", self.vis_range);
        }
        if self.roi_size.contains(&0) {
            anyhow::bail!("roi_size must be non-zero, got {:?}", self.roi_size);
        }
        if self.sw_batch_size == 0 {
            anyhow::bail!("sw_batch_size must be at least 1");
        }
        if !(0.0..1.0).contains(&self.overlap) {
            anyhow::bail!("overlap must be in [0, 1), got {}", self.overlap);
        }
        Ok(())
    }

    pub fn intensity_window(&self) -> Window {
        Window::new(self.window[0], self.window[1])
    }

    pub fn display_window(&self) -> Window {
        Window::new(self.vis_range[0], self.vis_range[1])
    }
}
