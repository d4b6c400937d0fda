//! # lobeseg
//!
//! Lung lobe and emphysema segmentation for chest CT volumes in NIfTI format,
//! plus a small dataset stager for building per-cohort input folders.
//!
//! The `infer` pipeline per case:
//!
//! 1. Load the volume and its geometry ([`volume`])
//! 2. Resample, reorient to RAS, mask the body and window ([`preprocess`])
//! 3. Sliding-window inference with the lobe network ([`inference`], [`model`])
//! 4. Map labels back to the native grid and clean them up ([`postprocess`])
//! 5. Write the label map, render overlays, resample onto the input grid
//!    with NiftyReg ([`writer`], [`render`], [`resample`])

pub mod batch;
pub mod config;
pub mod error;
pub mod inference;
pub mod model;
pub mod morphology;
pub mod postprocess;
pub mod preprocess;
pub mod render;
pub mod resample;
pub mod stage;
pub mod startup;
pub mod transforms;
pub mod utils;
pub mod volume;
pub mod writer;
