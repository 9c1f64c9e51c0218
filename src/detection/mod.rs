//! Detector output: the raw prediction model, the confidence filter, and a
//! detector backed by a table of precomputed predictions.
//!
//! The detection network itself lives outside this crate. Anything that can
//! answer "which label regions are in this image" implements [`Detector`].

pub mod filter;
pub mod predictions;

pub use filter::{filter_detections, AcceptedBox, ParseMode};
pub use predictions::{write_predictions_csv, PredictionTable};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// A numeric field as the detector emitted it.
///
/// Predictions that went through a CSV round trip (or a tensor `repr`)
/// arrive as text such as `"tensor(0.9134)"`, so both shapes are accepted
/// and parsed later by the filter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawValue {
    Number(f64),
    Text(String),
}

impl From<f64> for RawValue {
    fn from(value: f64) -> Self {
        RawValue::Number(value)
    }
}

impl From<&str> for RawValue {
    fn from(value: &str) -> Self {
        RawValue::Text(value.to_string())
    }
}

impl fmt::Display for RawValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RawValue::Number(n) => write!(f, "{}", n),
            RawValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// One predicted label region. Coordinates are in source image pixels and
/// may be unordered.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// File name of the source image
    pub source_image_id: String,
    pub class_label: String,
    pub confidence: RawValue,
    pub xmin: RawValue,
    pub ymin: RawValue,
    pub xmax: RawValue,
    pub ymax: RawValue,
}

impl Detection {
    /// Convenience constructor for numeric detector output.
    pub fn new(
        source_image_id: &str,
        class_label: &str,
        confidence: f64,
        [xmin, ymin, xmax, ymax]: [f64; 4],
    ) -> Self {
        Self {
            source_image_id: source_image_id.to_string(),
            class_label: class_label.to_string(),
            confidence: confidence.into(),
            xmin: xmin.into(),
            ymin: ymin.into(),
            xmax: xmax.into(),
            ymax: ymax.into(),
        }
    }
}

/// Source of label regions for an image.
///
/// Shared by every worker of a run, so implementations must be `Sync`.
pub trait Detector: Send + Sync {
    /// Class labels the detector can emit. Used to create per-class output
    /// directories before any worker starts.
    fn classes(&self) -> Vec<String>;

    /// Predictions for one image, in detector output order.
    fn detect(&self, image_path: &Path) -> Result<Vec<Detection>>;
}
