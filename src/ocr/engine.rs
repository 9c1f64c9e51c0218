use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use std::path::PathBuf;
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::transcript::WordBox;

/// Text recognized in one image.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Per-word geometry, only produced by engines that report it
    pub bounding_boxes: Option<Vec<WordBox>>,
}

impl OcrOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            bounding_boxes: None,
        }
    }
}

/// An OCR backend. Each worker owns one instance.
pub trait OcrEngine: Send {
    fn name(&self) -> &'static str;

    /// Engines that run their own preprocessing get the raw crop instead of
    /// the normalized image.
    fn preprocesses_internally(&self) -> bool {
        false
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutput>;
}

/// Runs the `tesseract` command line tool.
#[derive(Debug, Clone)]
pub struct TesseractEngine {
    executable: PathBuf,
    tessdata_dir: Option<PathBuf>,
    languages: String,
    flags: Vec<String>,
}

impl TesseractEngine {
    pub fn new(
        executable: PathBuf,
        tessdata_dir: Option<PathBuf>,
        languages: impl Into<String>,
        flags: Vec<String>,
    ) -> Self {
        Self {
            executable,
            tessdata_dir,
            languages: languages.into(),
            flags,
        }
    }

    fn command(&self, input: &std::path::Path) -> Command {
        let mut cmd = Command::new(&self.executable);
        cmd.arg(input).arg("stdout").arg("-l").arg(&self.languages);
        if let Some(dir) = &self.tessdata_dir {
            cmd.arg("--tessdata-dir").arg(dir);
        }
        cmd.args(&self.flags);
        cmd
    }
}

impl OcrEngine for TesseractEngine {
    fn name(&self) -> &'static str {
        "tesseract"
    }

    fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutput> {
        // Tesseract reads from a file; PNG keeps the binarized pixels intact
        let temp_input = NamedTempFile::with_suffix(".png")?;
        image
            .save(temp_input.path())
            .context("Failed to write OCR input image")?;

        let output = self
            .command(temp_input.path())
            .output()
            .context(format!("Failed to run {}", self.executable.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Tesseract failed: {}", stderr.trim()));
        }

        let text = String::from_utf8_lossy(&output.stdout).to_string();
        debug!(chars = text.len(), "Tesseract output");
        Ok(OcrOutput::text(text))
    }
}
