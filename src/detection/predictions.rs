//! Prediction tables: detector output persisted as CSV.
//!
//! Reading: `filename,class,score,xmin,ymin,xmax,ymax`, optionally preceded
//! by an unnamed index column (the shape a pandas `to_csv` produces). Column
//! order is taken from the header. Values are kept as raw text and parsed
//! later by the confidence filter.
//!
//! Writing: the filtered boxes of a run, one row per accepted box.

use anyhow::{anyhow, Context, Result};
use csv::StringRecord;
use std::collections::HashMap;
use std::path::Path;
use tracing::{info, warn};

use super::{AcceptedBox, Detection, Detector, RawValue};

/// Required columns, also the header row of written tables.
const COLUMNS: [&str; 7] = ["filename", "class", "score", "xmin", "ymin", "xmax", "ymax"];

/// Detector answering from a table of precomputed predictions.
#[derive(Debug, Clone, Default)]
pub struct PredictionTable {
    classes: Vec<String>,
    by_image: HashMap<String, Vec<Detection>>,
}

impl PredictionTable {
    /// Builds a table from detections already in memory.
    ///
    /// Classes are collected in first-seen order.
    pub fn from_detections(detections: Vec<Detection>) -> Self {
        let mut table = Self::default();
        for detection in detections {
            if !table.classes.contains(&detection.class_label) {
                table.classes.push(detection.class_label.clone());
            }
            table
                .by_image
                .entry(detection.source_image_id.clone())
                .or_default()
                .push(detection);
        }
        table
    }

    /// Loads a prediction CSV.
    ///
    /// Skips malformed rows (with a warning), the way a partially written
    /// table from an interrupted detection run should be read.
    pub fn from_csv(path: &Path) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_path(path)
            .context(format!("Failed to open predictions file: {}", path.display()))?;

        let header = reader
            .headers()
            .context(format!("Failed to read predictions header: {}", path.display()))?;
        if header.is_empty() {
            return Err(anyhow!("Predictions file is empty: {}", path.display()));
        }
        let positions = column_positions(header)?;

        let mut detections = Vec::new();
        for result in reader.records() {
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    warn!(error = %e, "Skipping unreadable prediction row");
                    continue;
                }
            };

            match parse_row(&record, &positions) {
                Ok(detection) => detections.push(detection),
                Err(e) => {
                    let line = record.position().map(|p| p.line()).unwrap_or_default();
                    warn!(line, error = %e, "Skipping malformed prediction row");
                }
            }
        }

        info!(
            rows = detections.len(),
            path = %path.display(),
            "Loaded prediction table"
        );
        Ok(Self::from_detections(detections))
    }

    /// Replaces the class list, e.g. with the full label set of the model
    /// when some classes never occur in this table.
    pub fn with_classes(mut self, classes: Vec<String>) -> Self {
        if !classes.is_empty() {
            self.classes = classes;
        }
        self
    }

    pub fn len(&self) -> usize {
        self.by_image.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Detector for PredictionTable {
    fn classes(&self) -> Vec<String> {
        self.classes.clone()
    }

    fn detect(&self, image_path: &Path) -> Result<Vec<Detection>> {
        let file_name = image_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| anyhow!("Not a file path: {}", image_path.display()))?;

        Ok(self.by_image.get(&file_name).cloned().unwrap_or_default())
    }
}

/// Maps each required column name to its index in the header.
fn column_positions(header: &StringRecord) -> Result<[usize; 7]> {
    let mut positions = [0usize; 7];

    for (slot, column) in positions.iter_mut().zip(COLUMNS) {
        *slot = header
            .iter()
            .position(|name| name == column)
            .ok_or_else(|| anyhow!("Predictions header is missing column '{}'", column))?;
    }

    Ok(positions)
}

fn parse_row(record: &StringRecord, positions: &[usize; 7]) -> Result<Detection> {
    let needed = positions.iter().max().copied().unwrap_or(0) + 1;
    if record.len() < needed {
        return Err(anyhow!("Expected at least {} columns, got {}", needed, record.len()));
    }

    let text = |i: usize| record.get(positions[i]).unwrap_or_default().to_string();
    let field = |i: usize| RawValue::Text(text(i));

    Ok(Detection {
        source_image_id: text(0),
        class_label: text(1),
        confidence: field(2),
        xmin: field(3),
        ymin: field(4),
        xmax: field(5),
        ymax: field(6),
    })
}

/// Writes the accepted boxes of a run as a fresh CSV file.
pub fn write_predictions_csv(path: &Path, boxes: &[AcceptedBox]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_path(path)
        .context(format!("Failed to create predictions file: {}", path.display()))?;
    writer
        .write_record(COLUMNS)
        .context("Failed to write predictions header")?;

    for b in boxes {
        writer.serialize(b).context("Failed to write prediction row")?;
    }

    writer.flush().context("Failed to flush predictions file")?;
    Ok(())
}
