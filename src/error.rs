//! Per-case failure reasons.

use thiserror::Error;

/// Why a single case could not be completed.
///
/// Each variant names the pipeline stage that failed; the inner error keeps
/// the full context chain.
#[derive(Debug, Error)]
pub enum CaseError {
    #[error("failed to load volume: {0:#}")]
    Load(anyhow::Error),
    #[error("preprocessing failed: {0:#}")]
    Preprocess(anyhow::Error),
    #[error("inference failed: {0:#}")]
    Inference(anyhow::Error),
    #[error("postprocessing failed: {0:#}")]
    Postprocess(anyhow::Error),
    #[error("failed to write output: {0:#}")]
    Write(anyhow::Error),
    #[error("resampling to native grid failed: {0}")]
    Resample(String),
}

impl CaseError {
    pub fn stage(&self) -> &'static str {
        match self {
            Self::Load(_) => "load",
            Self::Preprocess(_) => "preprocess",
            Self::Inference(_) => "inference",
            Self::Postprocess(_) => "postprocess",
            Self::Write(_) => "write",
            Self::Resample(_) => "resample",
        }
    }
}
