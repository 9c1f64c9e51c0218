pub mod blank;
pub mod deskew;
pub mod dispatch;
pub mod engine;
pub mod preprocess;
pub mod qr;
pub mod setup;
pub mod vision;

pub use blank::BlankLabelFilter;
pub use dispatch::{Dispatched, Dispatcher};
pub use engine::{OcrEngine, OcrOutput, TesseractEngine};
pub use preprocess::{ExtraStep, NormalizedImage, ThresholdMode, TransformChain};
pub use qr::{QrReader, RqrrReader};
pub use vision::VisionEngine;

use anyhow::Result;
use std::time::Duration;
use tracing::info;

use crate::error::PipelineError;
use crate::pipeline::config::{OcrBackend, OcrConfig};

/// Builds one engine per call. Every worker calls it once.
pub type EngineFactory = dyn Fn() -> Result<Box<dyn OcrEngine>> + Send + Sync;

/// Checks that the configured backend is usable and returns a factory for it.
///
/// Runs once at startup so a missing engine fails the run before any work
/// is dispatched.
pub fn engine_factory(config: &OcrConfig) -> Result<Box<EngineFactory>> {
    match config.backend {
        OcrBackend::Tesseract => {
            let executable = setup::locate_tesseract(config.tesseract_path.as_deref())?;
            let tessdata = setup::find_tessdata_dir(&config.languages);
            info!(
                executable = %executable.display(),
                tessdata = ?tessdata,
                languages = %config.languages,
                "Tesseract ready"
            );

            let languages = config.languages.clone();
            let flags = config.flags.clone();
            Ok(Box::new(move || {
                Ok(Box::new(TesseractEngine::new(
                    executable.clone(),
                    tessdata.clone(),
                    languages.clone(),
                    flags.clone(),
                )) as Box<dyn OcrEngine>)
            }))
        }
        OcrBackend::Vision => {
            let api_key = std::env::var(&config.vision_api_key_env).map_err(|_| {
                PipelineError::EngineNotFound(format!(
                    "environment variable {} holding the Vision API key is not set",
                    config.vision_api_key_env
                ))
            })?;
            info!(endpoint = %config.vision_endpoint, "Vision API ready");

            let endpoint = config.vision_endpoint.clone();
            let timeout = Duration::from_secs(config.request_timeout_secs);
            Ok(Box::new(move || {
                Ok(Box::new(VisionEngine::new(endpoint.clone(), api_key.clone(), timeout)?)
                    as Box<dyn OcrEngine>)
            }))
        }
    }
}
