//! Segmentation network backends.
//!
//! The shipped backend runs an ONNX export of the lobe UNet with tract.
//! Models take a batch of single-channel patches `(B, 1, X, Y, Z)` and return
//! per-class logits `(B, C, X, Y, Z)`.

use std::path::Path;

use anyhow::{Context, Result};
use log::{debug, info};
use ndarray::{Array5, ArrayView5, Axis, s};
use tract_onnx::prelude::*;

/// A network that maps image patches to class logits.
pub trait SegmentationModel {
    /// Number of output channels (classes, background included).
    fn num_classes(&self) -> usize;

    /// Run one batch of patches.
    fn predict(&self, patches: ArrayView5<'_, f32>) -> Result<Array5<f32>>;
}

type Plan = SimplePlan<TypedFact, Box<dyn TypedOp>, TypedModel>;

/// 3D UNet exported to ONNX, optimized for a fixed batch and patch size.
pub struct OnnxUnet {
    plan: Plan,
    batch: usize,
    roi: [usize; 3],
    classes: usize,
}

impl OnnxUnet {
    /// Load and optimize the network for `batch` patches of size `roi`.
    pub fn load(path: &Path, batch: usize, roi: [usize; 3]) -> Result<Self> {
        info!("Loading segmentation model from {path:?}");
        let input_shape = tvec!(batch, 1, roi[0], roi[1], roi[2]);
        let model = tract_onnx::onnx()
            .model_for_path(path)
            .with_context(|| format!("Failed to read ONNX model: {path:?}"))?
            .with_input_fact(0, InferenceFact::dt_shape(f32::datum_type(), input_shape))
            .context("Model does not accept a 5D float input")?
            .into_optimized()
            .context("Failed to optimize model")?;

        let output_shape = model
            .output_fact(0)
            .context("Model has no output")?
            .shape
            .as_concrete()
            .map(|shape| shape.to_vec())
            .context("Model output shape is not fixed")?;
        if output_shape.len() != 5 || output_shape[0] != batch || output_shape[2..] != roi {
            anyhow::bail!(
                "Model output shape {output_shape:?} does not match input [{batch}, 1, {roi:?}]"
            );
        }
        let classes = output_shape[1];
        debug!("Model output: {classes} classes, patch {roi:?}, batch {batch}");

        let plan = model.into_runnable().context("Failed to build execution plan")?;
        Ok(Self {
            plan,
            batch,
            roi,
            classes,
        })
    }
}

impl SegmentationModel for OnnxUnet {
    fn num_classes(&self) -> usize {
        self.classes
    }

    fn predict(&self, patches: ArrayView5<'_, f32>) -> Result<Array5<f32>> {
        let (count, channels, x, y, z) = patches.dim();
        if count == 0 || count > self.batch || channels != 1 || [x, y, z] != self.roi {
            anyhow::bail!(
                "Patch batch {:?} does not fit model input [{}, 1, {:?}]",
                patches.dim(),
                self.batch,
                self.roi
            );
        }

        // The plan is compiled for a full batch; pad short batches with zeros.
        let mut input = Array5::<f32>::zeros((self.batch, 1, x, y, z));
        input.slice_mut(s![..count, .., .., .., ..]).assign(&patches);
        let tensor = Tensor::from_shape(
            &[self.batch, 1, x, y, z],
            input.as_slice().context("Input batch is not contiguous")?,
        )?;

        let outputs = self.plan.run(tvec!(tensor.into()))?;
        let output = outputs.first().context("Model produced no output")?;
        let logits = output
            .as_slice::<f32>()
            .context("Model output is not float32")?;
        let full = Array5::from_shape_vec((self.batch, self.classes, x, y, z), logits.to_vec())
            .context("Model output does not match the expected shape")?;

        Ok(full.slice_axis(Axis(0), (0..count).into()).to_owned())
    }
}
