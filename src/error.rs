//! Fatal error kinds.
//!
//! Anything in here stops a run before work is dispatched (or, for
//! `RemoteOcr`/`MalformedField`, fails the single image it belongs to).
//! Everything else travels as `anyhow::Error` with context attached.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("input directory does not exist: {}", .0.display())]
    InputDirMissing(PathBuf),

    #[error("no images found in {}", .0.display())]
    NoImages(PathBuf),

    #[error("block size must be odd and at least 3, got {0}")]
    InvalidBlockSize(u32),

    #[error("blur kernel must be odd and at least 1, got {0}")]
    InvalidBlurKernel(u32),

    #[error("skew angle range is empty: min {min} is not below max {max}")]
    InvalidAngleRange { min: f32, max: f32 },

    #[error("confidence threshold must lie in [0, 1], got {0}")]
    InvalidThreshold(f64),

    #[error("blank label filter: {0}")]
    InvalidBlankFilter(String),

    #[error("images {} and {} would produce the same crop names", .first.display(), .second.display())]
    CropNameCollision { first: PathBuf, second: PathBuf },

    #[error("worker count must be at least 1")]
    InvalidWorkerCount,

    #[error("OCR engine not available: {0}")]
    EngineNotFound(String),

    #[error("malformed {field} value {raw:?}")]
    MalformedField { field: &'static str, raw: String },

    #[error("remote OCR error: {0}")]
    RemoteOcr(String),
}
