//! Confidence filtering and coordinate coercion for raw detections.

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Detection, RawValue};
use crate::error::PipelineError;

/// First number inside a field such as `tensor(812.4375)` or `" 0.93"`.
const NUMBER_PATTERN: &str = r"-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?";

/// How to treat numeric fields that do not parse cleanly.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParseMode {
    /// Take the first numeric substring, fall back to 0 and log a warning
    #[default]
    Lenient,
    /// Reject the whole detection set with `MalformedField`
    Strict,
}

/// A detection that passed the confidence threshold, with integer pixel
/// coordinates. Always satisfies `xmin <= xmax` and `ymin <= ymax`.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AcceptedBox {
    #[serde(rename = "filename")]
    pub source_image_id: String,
    #[serde(rename = "class")]
    pub class_label: String,
    #[serde(rename = "score")]
    pub confidence: f64,
    pub xmin: u32,
    pub ymin: u32,
    pub xmax: u32,
    pub ymax: u32,
}

impl AcceptedBox {
    pub fn width(&self) -> u32 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> u32 {
        self.ymax - self.ymin
    }

    pub fn is_degenerate(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Keeps detections with `confidence >= threshold` and coerces their
/// coordinates to ordered, non-negative integers.
///
/// Input order is preserved, which the cropper relies on for occurrence
/// numbering.
pub fn filter_detections(
    detections: &[Detection],
    threshold: f64,
    mode: ParseMode,
) -> Result<Vec<AcceptedBox>> {
    let number = Regex::new(NUMBER_PATTERN)?;
    let mut accepted = Vec::new();

    for detection in detections {
        let confidence = parse_field(&number, &detection.confidence, "confidence", mode)?;
        if confidence < threshold {
            debug!(
                image = %detection.source_image_id,
                class = %detection.class_label,
                confidence,
                "Detection below threshold"
            );
            continue;
        }

        let xmin = to_pixel(parse_field(&number, &detection.xmin, "xmin", mode)?);
        let ymin = to_pixel(parse_field(&number, &detection.ymin, "ymin", mode)?);
        let xmax = to_pixel(parse_field(&number, &detection.xmax, "xmax", mode)?);
        let ymax = to_pixel(parse_field(&number, &detection.ymax, "ymax", mode)?);

        accepted.push(AcceptedBox {
            source_image_id: detection.source_image_id.clone(),
            class_label: detection.class_label.clone(),
            confidence,
            xmin: xmin.min(xmax),
            ymin: ymin.min(ymax),
            xmax: xmin.max(xmax),
            ymax: ymin.max(ymax),
        });
    }

    Ok(accepted)
}

/// Truncates toward zero; negatives and NaN become 0.
fn to_pixel(value: f64) -> u32 {
    // `as` saturates: NaN -> 0, > u32::MAX -> u32::MAX
    value.trunc().max(0.0) as u32
}

fn parse_field(
    number: &Regex,
    value: &RawValue,
    field: &'static str,
    mode: ParseMode,
) -> Result<f64, PipelineError> {
    let parsed = match value {
        RawValue::Number(n) if n.is_finite() => Some(*n),
        RawValue::Number(_) => None,
        RawValue::Text(text) => {
            let trimmed = text.trim();
            trimmed
                .parse::<f64>()
                .ok()
                .filter(|n| n.is_finite())
                .or_else(|| number.find(trimmed).and_then(|m| m.as_str().parse().ok()))
        }
    };

    match (parsed, mode) {
        (Some(n), _) => Ok(n),
        (None, ParseMode::Lenient) => {
            warn!(field, raw = %value, "Unparseable detector value, using 0");
            Ok(0.0)
        }
        (None, ParseMode::Strict) => Err(PipelineError::MalformedField {
            field,
            raw: value.to_string(),
        }),
    }
}
