//! Volume transforms shared by the pre- and postprocessing pipelines.

pub mod body_mask;
pub mod intensity;
pub mod orientation;
pub mod spacing;

pub use orientation::{AxCodes, reorient};
pub use spacing::{SampleMode, resample_nearest, resample_to_spacing, resize_nearest};
