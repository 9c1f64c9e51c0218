//! Per-crop text extraction: QR first, OCR only when no code is found.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use image::DynamicImage;
use tracing::{debug, info};

use super::engine::OcrEngine;
use super::preprocess::TransformChain;
use super::qr::QrReader;
use crate::transcript::TranscriptRecord;

/// Result of dispatching one crop.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub record: TranscriptRecord,
    pub used_qr: bool,
}

/// Shared, read-only dispatch settings. Borrowed by every worker.
pub struct Dispatcher<'a> {
    qr: &'a dyn QrReader,
    chain: &'a TransformChain,
    /// Where normalized images are saved, if anywhere
    preprocessed_dir: Option<&'a Path>,
    ascii_only: bool,
}

impl<'a> Dispatcher<'a> {
    pub fn new(qr: &'a dyn QrReader, chain: &'a TransformChain) -> Self {
        Self {
            qr,
            chain,
            preprocessed_dir: None,
            ascii_only: false,
        }
    }

    pub fn with_preprocessed_dir(mut self, dir: Option<&'a Path>) -> Self {
        self.preprocessed_dir = dir;
        self
    }

    pub fn with_ascii_only(mut self, ascii_only: bool) -> Self {
        self.ascii_only = ascii_only;
        self
    }

    /// Produces the transcript for the crop named `file_name`.
    pub fn process(
        &self,
        file_name: &str,
        image: &DynamicImage,
        engine: &mut dyn OcrEngine,
    ) -> Result<Dispatched> {
        if let Some(payload) = self.qr.read(image) {
            info!(crop = file_name, "QR code decoded");
            return Ok(Dispatched {
                record: TranscriptRecord::new(file_name, payload),
                used_qr: true,
            });
        }

        let output = if engine.preprocesses_internally() {
            engine.recognize(image)?
        } else {
            let normalized = self.chain.apply(file_name, image);
            if let Some(dir) = self.preprocessed_dir {
                fs::create_dir_all(dir)
                    .context(format!("Failed to create directory: {}", dir.display()))?;
                let path = dir.join(&normalized.file_name);
                normalized
                    .image
                    .save(&path)
                    .context(format!("Failed to save preprocessed image: {}", path.display()))?;
            }
            engine.recognize(&DynamicImage::ImageLuma8(normalized.image))?
        };

        let mut text = collapse_newlines(&output.text);
        if self.ascii_only {
            text.retain(|c| c.is_ascii());
        }
        debug!(crop = file_name, engine = engine.name(), text = %text, "OCR result");

        let mut record = TranscriptRecord::new(file_name, text);
        record.bounding_boxes = output.bounding_boxes;
        Ok(Dispatched {
            record,
            used_qr: false,
        })
    }
}

/// Replaces every line break with a single space.
pub fn collapse_newlines(text: &str) -> String {
    text.replace("\r\n", " ").replace(['\n', '\r'], " ")
}
