//! Run configuration.
//!
//! Loaded from a JSON file (explicit path, else the per-user default
//! location), with every field optional. Command line flags are applied on
//! top by the binary, then `validate` runs before any work starts.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::detection::ParseMode;
use crate::error::PipelineError;
use crate::ocr::blank::BlankLabelFilter;
use crate::ocr::preprocess::{ExtraStep, ThresholdMode, TransformChain};
use crate::ocr::vision::DEFAULT_ENDPOINT;
use crate::paths;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detection: DetectionConfig,
    pub transform: TransformConfig,
    pub ocr: OcrConfig,
    pub run: RunConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Minimum detector confidence, inclusive
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default)]
    pub parse_mode: ParseMode,
    /// One output subdirectory per class
    #[serde(default = "default_true")]
    pub class_scoped: bool,
    /// Full class list of the detector; empty means "as seen in predictions"
    #[serde(default)]
    pub classes: Vec<String>,
}

fn default_threshold() -> f64 {
    0.8
}

fn default_true() -> bool {
    true
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            parse_mode: ParseMode::default(),
            class_scoped: true,
            classes: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransformConfig {
    #[serde(default)]
    pub threshold_mode: ThresholdMode,
    /// Overrides the per-mode default block size
    #[serde(default)]
    pub block_size: Option<u32>,
    /// Overrides the per-mode default bias constant
    #[serde(default)]
    pub c: Option<f64>,
    #[serde(default = "default_blur_kernel")]
    pub blur_kernel: u32,
    #[serde(default = "default_min_angle")]
    pub min_angle: f32,
    #[serde(default = "default_max_angle")]
    pub max_angle: f32,
    /// Fill value for area uncovered by deskew rotation
    #[serde(default)]
    pub background: u8,
    #[serde(default)]
    pub extra_steps: Vec<ExtraStep>,
}

fn default_blur_kernel() -> u32 {
    5
}

fn default_min_angle() -> f32 {
    -45.0
}

fn default_max_angle() -> f32 {
    45.0
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            threshold_mode: ThresholdMode::default(),
            block_size: None,
            c: None,
            blur_kernel: default_blur_kernel(),
            min_angle: default_min_angle(),
            max_angle: default_max_angle(),
            background: 0,
            extra_steps: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OcrBackend {
    #[default]
    Tesseract,
    Vision,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputEncoding {
    #[default]
    Utf8,
    Ascii,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OcrConfig {
    #[serde(default)]
    pub backend: OcrBackend,
    /// Tesseract language set, `+`-joined
    #[serde(default = "default_languages")]
    pub languages: String,
    #[serde(default = "default_flags")]
    pub flags: Vec<String>,
    #[serde(default)]
    pub tesseract_path: Option<PathBuf>,
    #[serde(default = "default_vision_endpoint")]
    pub vision_endpoint: String,
    /// Name of the environment variable holding the API key
    #[serde(default = "default_vision_api_key_env")]
    pub vision_api_key_env: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub encoding: OutputEncoding,
    /// Skip OCR for crops without text; off when absent
    #[serde(default)]
    pub blank_filter: Option<BlankLabelFilter>,
}

fn default_languages() -> String {
    "eng+deu+fra+ita+spa+por".to_string()
}

fn default_flags() -> Vec<String> {
    ["--psm", "6", "--oem", "3"].iter().map(|s| s.to_string()).collect()
}

fn default_vision_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_vision_api_key_env() -> String {
    "GOOGLE_VISION_API_KEY".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            backend: OcrBackend::default(),
            languages: default_languages(),
            flags: default_flags(),
            tesseract_path: None,
            vision_endpoint: default_vision_endpoint(),
            vision_api_key_env: default_vision_api_key_env(),
            request_timeout_secs: default_request_timeout_secs(),
            encoding: OutputEncoding::default(),
            blank_filter: None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerModel {
    /// Work-stealing pool, for local CPU-bound OCR
    #[default]
    Pool,
    /// Dedicated threads on a shared queue, for remote OCR
    Threads,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub worker_model: WorkerModel,
    /// Append-only `id<TAB>text` log written as transcripts complete
    #[serde(default)]
    pub backup_log: Option<PathBuf>,
    /// Keep normalized images next to the crops
    #[serde(default = "default_true")]
    pub save_preprocessed: bool,
}

/// Available CPUs, at most 4.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(4)
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            worker_model: WorkerModel::default(),
            backup_log: None,
            save_preprocessed: true,
        }
    }
}

impl PipelineConfig {
    /// Loads configuration.
    ///
    /// An explicit path must exist and parse. Without one, the default
    /// location is tried and defaults are used if it is missing or broken.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            let contents = fs::read_to_string(path)
                .context(format!("Failed to read config file: {}", path.display()))?;
            let config = serde_json::from_str(&contents)
                .context(format!("Failed to parse config file: {}", path.display()))?;
            info!(path = %path.display(), "Config loaded");
            return Ok(config);
        }

        let Some(path) = paths::default_config_path() else {
            info!("No config directory on this platform, using defaults");
            return Ok(Self::default());
        };

        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str(&c).map_err(anyhow::Error::from))
        {
            Ok(config) => {
                info!(path = %path.display(), "Config loaded");
                Ok(config)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to load config, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Checks every setting that would otherwise fail mid-run.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let threshold = self.detection.threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(PipelineError::InvalidThreshold(threshold));
        }
        if self.run.workers == 0 {
            return Err(PipelineError::InvalidWorkerCount);
        }
        TransformChain::from_config(&self.transform)?;
        if let Some(filter) = &self.ocr.blank_filter {
            filter.validate()?;
        }
        Ok(())
    }
}
