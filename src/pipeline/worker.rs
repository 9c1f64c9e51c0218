//! One unit of work, run end to end on a worker.
//!
//! A unit never touches shared mutable state: counts come back as part of
//! the outcome and are summed by the orchestrator. Backup log lines are
//! written only once the whole unit has succeeded, so the log never holds
//! records the final JSON leaves out.

use std::fs;

use anyhow::{anyhow, Context, Result};
use image::DynamicImage;
use tracing::{debug, warn};

use super::output::BackupLog;
use super::queue::WorkItem;
use crate::crop::Cropper;
use crate::detection::{filter_detections, AcceptedBox, Detector};
use crate::ocr::{BlankLabelFilter, Dispatcher, OcrEngine};
use crate::pipeline::config::DetectionConfig;
use crate::postprocess::NuriCorrector;
use crate::transcript::TranscriptRecord;

/// What a unit produced.
#[derive(Debug, Default, Clone)]
pub struct UnitOutcome {
    pub records: Vec<TranscriptRecord>,
    pub accepted: Vec<AcceptedBox>,
    pub crops_written: usize,
    pub qr_detected: usize,
    pub nuri_corrected: usize,
    pub blank_skipped: usize,
}

/// Read-only state shared by every worker of a run.
pub struct UnitContext<'a> {
    pub detector: Option<&'a dyn Detector>,
    pub detection: &'a DetectionConfig,
    pub cropper: Option<&'a Cropper>,
    pub dispatcher: Dispatcher<'a>,
    pub nuri: &'a NuriCorrector,
    pub blank: Option<&'a BlankLabelFilter>,
    pub backup: Option<&'a BackupLog>,
}

impl UnitContext<'_> {
    /// Detect, filter and crop one source image; then, given an engine,
    /// transcribe every non-empty crop.
    pub fn process_image(
        &self,
        item: &WorkItem,
        engine: Option<&mut dyn OcrEngine>,
    ) -> Result<UnitOutcome> {
        let (detector, cropper) = self
            .detector
            .zip(self.cropper)
            .ok_or_else(|| anyhow!("Image processing needs a detector and a cropper"))?;
        let source_id = item.file_name();

        let image = image::open(&item.path)
            .context(format!("Failed to load image: {}", item.path.display()))?;
        let detections = detector.detect(&item.path)?;
        let accepted = filter_detections(
            &detections,
            self.detection.threshold,
            self.detection.parse_mode,
        )?;
        let crops = cropper.crop(&image, &source_id, &accepted)?;
        debug!(
            image = %source_id,
            detections = detections.len(),
            accepted = accepted.len(),
            "Cropped image"
        );

        let mut outcome = UnitOutcome {
            crops_written: crops.len(),
            accepted,
            ..UnitOutcome::default()
        };

        let Some(engine) = engine else {
            return Ok(outcome);
        };

        for crop in &crops {
            let file_name = crop.file_name();
            if crop.is_empty() {
                warn!(crop = %file_name, "Skipping empty crop");
                continue;
            }
            self.transcribe(&file_name, &crop.image, &mut *engine, &mut outcome)?;
        }

        self.write_backup(&outcome.records);
        Ok(outcome)
    }

    /// Transcribe one existing crop file.
    pub fn process_crop(&self, item: &WorkItem, engine: &mut dyn OcrEngine) -> Result<UnitOutcome> {
        let file_name = item.file_name();
        let mut outcome = UnitOutcome::default();

        let size = fs::metadata(&item.path)
            .context(format!("Failed to stat crop: {}", item.path.display()))?
            .len();
        if size == 0 {
            warn!(crop = %file_name, "Skipping empty crop");
            return Ok(outcome);
        }

        let image = image::open(&item.path)
            .context(format!("Failed to load crop: {}", item.path.display()))?;
        self.transcribe(&file_name, &image, engine, &mut outcome)?;
        self.write_backup(&outcome.records);
        Ok(outcome)
    }

    fn transcribe(
        &self,
        file_name: &str,
        image: &DynamicImage,
        engine: &mut dyn OcrEngine,
        outcome: &mut UnitOutcome,
    ) -> Result<()> {
        if self.blank.is_some_and(|filter| filter.is_blank(image)) {
            debug!(crop = file_name, "Skipping blank crop");
            outcome.blank_skipped += 1;
            return Ok(());
        }

        let dispatched = self.dispatcher.process(file_name, image, engine)?;

        // A decoded QR payload is authoritative
        let record = if dispatched.used_qr {
            outcome.qr_detected += 1;
            dispatched.record
        } else {
            let (record, corrected) = self.nuri.correct(dispatched.record);
            if corrected {
                debug!(crop = file_name, text = %record.text, "NURI corrected");
                outcome.nuri_corrected += 1;
            }
            record
        };

        outcome.records.push(record);
        Ok(())
    }

    fn write_backup(&self, records: &[TranscriptRecord]) {
        let Some(backup) = self.backup else {
            return;
        };
        for record in records {
            // The backup is a convenience copy; losing a line is not fatal
            if let Err(e) = backup.append(record) {
                warn!(crop = %record.id, error = %e, "Failed to append to backup log");
            }
        }
    }
}
