//! Orchestration: fan units out over workers, gather outcomes, aggregate.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use serde::Serialize;
use tracing::{error, info, warn};

use super::config::{OutputEncoding, PipelineConfig, WorkerModel};
use super::output::{save_json, BackupLog};
use super::queue::{create_work_queue, WorkItem};
use super::worker::{UnitContext, UnitOutcome};
use crate::crop::Cropper;
use crate::error::PipelineError;
use crate::detection::{write_predictions_csv, AcceptedBox, Detector};
use crate::ocr::{Dispatcher, EngineFactory, OcrEngine, QrReader, RqrrReader, TransformChain};
use crate::paths;
use crate::postprocess::NuriCorrector;
use crate::transcript::TranscriptRecord;

/// Counts for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub qr_detected_count: usize,
    pub nuri_corrected_count: usize,
    pub crops_written: usize,
    pub blank_skipped_count: usize,
}

/// A unit that failed. Its image contributes no records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub image: PathBuf,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub started_at: DateTime<Local>,
    /// Units dispatched (images or crop files)
    pub images: usize,
    /// Sorted by id
    pub records: Vec<TranscriptRecord>,
    pub stats: RunStats,
    pub failures: Vec<Failure>,
}

impl RunSummary {
    /// Writes the records as the run's JSON result.
    pub fn save(&self, path: &Path) -> Result<()> {
        save_json(path, &self.records)
            .context(format!("Failed to write transcripts to {}", path.display()))
    }
}

type UnitResult = Result<UnitOutcome, String>;

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

/// Runs `unit` for one item with the worker's engine, containing panics.
fn run_contained<F>(
    unit: &F,
    item: &WorkItem,
    engine: &mut Option<Result<Box<dyn OcrEngine>, String>>,
) -> UnitResult
where
    F: Fn(&WorkItem, Option<&mut dyn OcrEngine>) -> Result<UnitOutcome> + Sync,
{
    let engine: Option<&mut dyn OcrEngine> = match engine {
        None => None,
        Some(Ok(engine)) => Some(engine.as_mut()),
        Some(Err(message)) => return Err(format!("OCR engine unavailable: {}", message)),
    };

    match catch_unwind(AssertUnwindSafe(|| unit(item, engine))) {
        Ok(Ok(outcome)) => Ok(outcome),
        Ok(Err(e)) => Err(format!("{:#}", e)),
        Err(payload) => Err(panic_message(payload)),
    }
}

fn make_engine(factory: Option<&EngineFactory>) -> Option<Result<Box<dyn OcrEngine>, String>> {
    factory.map(|f| f().map_err(|e| format!("{:#}", e)))
}

/// Runs every item on `workers` workers, each owning one engine from
/// `factory`. Results come back in item order.
fn run_units<F>(
    items: Vec<WorkItem>,
    workers: usize,
    model: WorkerModel,
    factory: Option<&EngineFactory>,
    unit: F,
) -> Result<Vec<(WorkItem, UnitResult)>>
where
    F: Fn(&WorkItem, Option<&mut dyn OcrEngine>) -> Result<UnitOutcome> + Sync,
{
    let mut results = match model {
        WorkerModel::Pool => {
            let pool = ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|i| format!("label-worker-{}", i))
                .build()
                .context("Failed to build worker pool")?;

            pool.install(|| {
                items
                    .into_par_iter()
                    .map_init(
                        || make_engine(factory),
                        |engine, item| {
                            let result = run_contained(&unit, &item, engine);
                            (item, result)
                        },
                    )
                    .collect::<Vec<_>>()
            })
        }
        WorkerModel::Threads => {
            let (sender, receiver) = create_work_queue();
            for item in items {
                sender.send(item).context("Failed to queue work item")?;
            }
            drop(sender);

            let receiver = Mutex::new(receiver);
            let (result_tx, result_rx) = std::sync::mpsc::channel();

            thread::scope(|scope| {
                for i in 0..workers {
                    let result_tx = result_tx.clone();
                    let receiver = &receiver;
                    let unit = &unit;
                    thread::Builder::new()
                        .name(format!("label-worker-{}", i))
                        .spawn_scoped(scope, move || {
                            let mut engine = make_engine(factory);
                            loop {
                                // Lock only long enough to take one item
                                let next = match receiver.lock() {
                                    Ok(rx) => rx.recv(),
                                    Err(_) => break,
                                };
                                let Ok(item) = next else {
                                    break;
                                };
                                let result = run_contained(unit, &item, &mut engine);
                                if result_tx.send((item, result)).is_err() {
                                    break;
                                }
                            }
                        })
                        .context("Failed to spawn worker thread")?;
                }
                drop(result_tx);
                Ok::<_, anyhow::Error>(result_rx.iter().collect::<Vec<_>>())
            })?
        }
    };

    results.sort_by_key(|(item, _)| item.index);
    Ok(results)
}

/// Runs the pipeline over a directory. Holds everything that is fixed for
/// the lifetime of a run.
pub struct Orchestrator {
    config: PipelineConfig,
    chain: TransformChain,
    qr: Box<dyn QrReader>,
    nuri: NuriCorrector,
}

impl Orchestrator {
    /// Validates `config`. Fails before any filesystem side effect.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let chain = TransformChain::from_config(&config.transform)?;

        Ok(Self {
            config,
            chain,
            qr: Box::new(RqrrReader),
            nuri: NuriCorrector::new()?,
        })
    }

    pub fn with_qr_reader(mut self, qr: Box<dyn QrReader>) -> Self {
        self.qr = qr;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    fn dispatcher<'a>(&'a self, preprocessed_dir: Option<&'a Path>) -> Dispatcher<'a> {
        Dispatcher::new(self.qr.as_ref(), &self.chain)
            .with_preprocessed_dir(preprocessed_dir)
            .with_ascii_only(self.config.ocr.encoding == OutputEncoding::Ascii)
    }

    fn cropper(&self, image_dir: &Path, out_dir: &Path, detector: &dyn Detector, images: &[PathBuf]) -> Result<Cropper> {
        let cropper = Cropper::new(
            paths::derived_path(out_dir, image_dir, "_cropped"),
            self.config.detection.class_scoped,
        )?;
        check_name_collisions(&cropper, images)?;

        let mut classes = self.config.detection.classes.clone();
        if classes.is_empty() {
            classes = detector.classes();
        }
        cropper.prepare_dirs(&classes)?;
        Ok(cropper)
    }

    /// Detects, crops and transcribes every image in `image_dir`.
    ///
    /// Crops go to `<out_dir>/<dir>_cropped`, normalized images to
    /// `<out_dir>/<dir>_preprocessed` and accepted boxes to
    /// `<out_dir>/<dir>_predictions.csv`.
    pub fn run(
        &self,
        image_dir: &Path,
        out_dir: &Path,
        detector: &dyn Detector,
        factory: &EngineFactory,
    ) -> Result<RunSummary> {
        let started_at = Local::now();
        let images = paths::list_images(image_dir)?;
        info!(images = images.len(), dir = %image_dir.display(), "Starting run");

        let cropper = self.cropper(image_dir, out_dir, detector, &images)?;
        let preprocessed = self
            .config
            .run
            .save_preprocessed
            .then(|| paths::derived_path(out_dir, image_dir, "_preprocessed"));
        let backup = self.config.run.backup_log.as_ref().map(BackupLog::new);

        let ctx = UnitContext {
            detector: Some(detector),
            detection: &self.config.detection,
            cropper: Some(&cropper),
            dispatcher: self.dispatcher(preprocessed.as_deref()),
            nuri: &self.nuri,
            blank: self.config.ocr.blank_filter.as_ref(),
            backup: backup.as_ref(),
        };

        let results = run_units(
            work_items(images),
            self.config.run.workers,
            self.config.run.worker_model,
            Some(factory),
            |item, engine| ctx.process_image(item, engine),
        )?;

        let (summary, accepted) = aggregate(started_at, results);
        write_predictions_csv(&paths::derived_path(out_dir, image_dir, "_predictions.csv"), &accepted)?;
        Ok(summary)
    }

    /// Detects and crops only; no OCR.
    pub fn crop_only(
        &self,
        image_dir: &Path,
        out_dir: &Path,
        detector: &dyn Detector,
    ) -> Result<RunSummary> {
        let started_at = Local::now();
        let images = paths::list_images(image_dir)?;
        info!(images = images.len(), dir = %image_dir.display(), "Starting crop run");

        let cropper = self.cropper(image_dir, out_dir, detector, &images)?;
        let ctx = UnitContext {
            detector: Some(detector),
            detection: &self.config.detection,
            cropper: Some(&cropper),
            dispatcher: self.dispatcher(None),
            nuri: &self.nuri,
            blank: None,
            backup: None,
        };

        let results = run_units(
            work_items(images),
            self.config.run.workers,
            self.config.run.worker_model,
            None,
            |item, _| ctx.process_image(item, None),
        )?;

        let (summary, accepted) = aggregate(started_at, results);
        write_predictions_csv(&paths::derived_path(out_dir, image_dir, "_predictions.csv"), &accepted)?;
        Ok(summary)
    }

    /// QR/OCR over an existing directory of crops (class subdirectories
    /// included).
    pub fn ocr_directory(
        &self,
        crop_dir: &Path,
        preprocessed_dir: Option<&Path>,
        factory: &EngineFactory,
    ) -> Result<RunSummary> {
        let started_at = Local::now();
        let crops = paths::list_crops(crop_dir)?;
        info!(crops = crops.len(), dir = %crop_dir.display(), "Starting OCR run");

        let backup = self.config.run.backup_log.as_ref().map(BackupLog::new);
        let ctx = UnitContext {
            detector: None,
            detection: &self.config.detection,
            cropper: None,
            dispatcher: self.dispatcher(preprocessed_dir),
            nuri: &self.nuri,
            blank: self.config.ocr.blank_filter.as_ref(),
            backup: backup.as_ref(),
        };

        let results = run_units(
            work_items(crops),
            self.config.run.workers,
            self.config.run.worker_model,
            Some(factory),
            |item, engine| match engine {
                Some(engine) => ctx.process_crop(item, engine),
                None => Err(anyhow::anyhow!("No OCR engine for worker")),
            },
        )?;

        Ok(aggregate(started_at, results).0)
    }
}

fn work_items(paths: Vec<PathBuf>) -> Vec<WorkItem> {
    paths
        .into_iter()
        .enumerate()
        .map(|(index, path)| WorkItem::new(path, index))
        .collect()
}

/// Crops of two images would overwrite each other if their stems only
/// differ by the `_label` marker or extension.
fn check_name_collisions(cropper: &Cropper, images: &[PathBuf]) -> Result<(), PipelineError> {
    let mut seen: HashMap<String, &Path> = HashMap::new();
    for image in images {
        let name = image
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let key = cropper.crop_file_name(&name, "", 0);
        if let Some(previous) = seen.insert(key, image) {
            return Err(PipelineError::CropNameCollision {
                first: previous.to_path_buf(),
                second: image.clone(),
            });
        }
    }
    Ok(())
}

/// Folds unit results into a summary. Records are sorted by id.
fn aggregate(
    started_at: DateTime<Local>,
    results: Vec<(WorkItem, UnitResult)>,
) -> (RunSummary, Vec<AcceptedBox>) {
    let images = results.len();
    let mut records = Vec::new();
    let mut accepted = Vec::new();
    let mut stats = RunStats::default();
    let mut failures = Vec::new();

    for (item, result) in results {
        match result {
            Ok(outcome) => {
                stats.qr_detected_count += outcome.qr_detected;
                stats.nuri_corrected_count += outcome.nuri_corrected;
                stats.crops_written += outcome.crops_written;
                stats.blank_skipped_count += outcome.blank_skipped;
                records.extend(outcome.records);
                accepted.extend(outcome.accepted);
            }
            Err(message) => {
                error!(image = %item.path.display(), error = %message, "Unit failed");
                failures.push(Failure {
                    image: item.path,
                    message,
                });
            }
        }
    }

    records.sort_by(|a, b| a.id.cmp(&b.id));

    let elapsed = Local::now() - started_at;
    info!(
        images,
        records = records.len(),
        crops = stats.crops_written,
        qr_detected = stats.qr_detected_count,
        nuri_corrected = stats.nuri_corrected_count,
        blank_skipped = stats.blank_skipped_count,
        failed = failures.len(),
        elapsed_ms = elapsed.num_milliseconds(),
        "Run complete"
    );
    if !failures.is_empty() {
        warn!(count = failures.len(), "Some images failed and were left out");
    }

    (
        RunSummary {
            started_at,
            images,
            records,
            stats,
            failures,
        },
        accepted,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::{Detection, PredictionTable};
    use crate::ocr::OcrOutput;
    use image::{DynamicImage, ImageBuffer, Rgb};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::tempdir;

    struct NoQr;

    impl QrReader for NoQr {
        fn read(&self, _image: &DynamicImage) -> Option<String> {
            None
        }
    }

    struct EchoEngine;

    impl OcrEngine for EchoEngine {
        fn name(&self) -> &'static str {
            "echo"
        }

        fn recognize(&mut self, image: &DynamicImage) -> Result<OcrOutput> {
            Ok(OcrOutput::text(format!("{}x{}", image.width(), image.height())))
        }
    }

    fn counting_factory(created: Arc<AtomicUsize>) -> Box<EngineFactory> {
        Box::new(move || {
            created.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(EchoEngine) as Box<dyn OcrEngine>)
        })
    }

    fn write_image(dir: &Path, name: &str) {
        let img: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(64, 48, |x, y| Rgb([(x * 3) as u8, (y * 5) as u8, 128]));
        img.save(dir.join(name)).unwrap();
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(PathBuf::from(format!("img_{:02}.jpg", i)), i))
            .collect()
    }

    fn fake_outcome(item: &WorkItem) -> UnitOutcome {
        UnitOutcome {
            records: vec![TranscriptRecord::new(item.file_name(), "x")],
            qr_detected: item.index % 2,
            ..UnitOutcome::default()
        }
    }

    #[test]
    fn test_both_worker_models_return_results_in_order() {
        for model in [WorkerModel::Pool, WorkerModel::Threads] {
            let created = Arc::new(AtomicUsize::new(0));
            let factory = counting_factory(created.clone());

            let results = run_units(items(20), 3, model, Some(factory.as_ref()), |item, engine| {
                assert!(engine.is_some());
                Ok(fake_outcome(item))
            })
            .unwrap();

            let indices: Vec<usize> = results.iter().map(|(item, _)| item.index).collect();
            assert_eq!(indices, (0..20).collect::<Vec<_>>());
            assert!(results.iter().all(|(_, r)| r.is_ok()));
            assert!(created.load(Ordering::SeqCst) >= 1);
        }
    }

    #[test]
    fn test_threads_model_builds_one_engine_per_worker() {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(created.clone());

        run_units(items(12), 3, WorkerModel::Threads, Some(factory.as_ref()), |item, _| {
            Ok(fake_outcome(item))
        })
        .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_panics_and_errors_are_contained() {
        for model in [WorkerModel::Pool, WorkerModel::Threads] {
            let results = run_units(items(6), 2, model, None, |item, _| match item.index {
                2 => panic!("corrupt image"),
                4 => Err(anyhow::anyhow!("detector failed")),
                _ => Ok(fake_outcome(item)),
            })
            .unwrap();

            let (summary, _) = aggregate(Local::now(), results);
            assert_eq!(summary.images, 6);
            assert_eq!(summary.records.len(), 4);
            assert_eq!(summary.failures.len(), 2);
            assert!(summary.failures[0].message.contains("corrupt image"));
            assert!(summary.failures[1].message.contains("detector failed"));
        }
    }

    #[test]
    fn test_aggregate_sums_counts_and_sorts() {
        let results = vec![
            (
                WorkItem::new(PathBuf::from("b.jpg"), 0),
                Ok(UnitOutcome {
                    records: vec![TranscriptRecord::new("b_typed_1.jpg", "B")],
                    qr_detected: 1,
                    nuri_corrected: 1,
                    blank_skipped: 2,
                    ..UnitOutcome::default()
                }),
            ),
            (
                WorkItem::new(PathBuf::from("a.jpg"), 1),
                Ok(UnitOutcome {
                    records: vec![TranscriptRecord::new("a_typed_1.jpg", "A")],
                    qr_detected: 1,
                    ..UnitOutcome::default()
                }),
            ),
        ];

        let (summary, _) = aggregate(Local::now(), results);

        assert_eq!(summary.stats.qr_detected_count, 2);
        assert_eq!(summary.stats.nuri_corrected_count, 1);
        assert_eq!(summary.stats.blank_skipped_count, 2);
        assert_eq!(summary.records[0].id, "a_typed_1.jpg");
    }

    #[test]
    fn test_failed_engine_construction_fails_units() {
        let factory: Box<EngineFactory> = Box::new(|| Err(anyhow::anyhow!("no tesseract")));

        let results = run_units(items(2), 1, WorkerModel::Threads, Some(factory.as_ref()), |item, _| {
            Ok(fake_outcome(item))
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| matches!(r, Err(m) if m.contains("no tesseract"))));
    }

    #[test]
    fn test_crop_only_writes_crops_and_predictions() {
        let dir = tempdir().unwrap();
        let input = dir.path().join("photos");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        write_image(&input, "A_label.jpg");

        let detector = PredictionTable::from_detections(vec![
            Detection::new("A_label.jpg", "typed", 0.9, [4.0, 4.0, 30.0, 20.0]),
            Detection::new("A_label.jpg", "typed", 0.5, [4.0, 4.0, 30.0, 20.0]),
        ])
        .with_classes(vec!["typed".to_string(), "handwritten".to_string()]);

        let orchestrator = Orchestrator::new(PipelineConfig::default()).unwrap();
        let summary = orchestrator.crop_only(&input, &out, &detector).unwrap();

        assert_eq!(summary.stats.crops_written, 1);
        assert!(summary.records.is_empty());
        assert!(out.join("photos_cropped").join("typed").join("A_typed_1.jpg").exists());
        assert!(out.join("photos_cropped").join("handwritten").is_dir());
        let csv = std::fs::read_to_string(out.join("photos_predictions.csv")).unwrap();
        assert_eq!(csv.lines().count(), 2);
    }

    #[test]
    fn test_ocr_directory_skips_empty_crops() {
        let dir = tempdir().unwrap();
        let crops = dir.path().join("photos_cropped").join("typed");
        std::fs::create_dir_all(&crops).unwrap();
        write_image(&crops, "A_typed_1.jpg");
        std::fs::write(crops.join("A_typed_2.jpg"), b"").unwrap();

        let orchestrator = Orchestrator::new(PipelineConfig::default())
            .unwrap()
            .with_qr_reader(Box::new(NoQr));
        let factory = counting_factory(Arc::new(AtomicUsize::new(0)));
        let summary = orchestrator
            .ocr_directory(&dir.path().join("photos_cropped"), None, factory.as_ref())
            .unwrap();

        assert_eq!(summary.images, 2);
        assert_eq!(summary.records.len(), 1);
        assert_eq!(summary.records[0].id, "A_typed_1.jpg");
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn test_colliding_crop_names_abort_before_output() {
        for pair in [["A_label.jpg", "A.jpg"], ["A.jpg", "A.jpeg"]] {
            let dir = tempdir().unwrap();
            let input = dir.path().join("photos");
            let out = dir.path().join("out");
            std::fs::create_dir_all(&input).unwrap();
            for name in pair {
                write_image(&input, name);
            }

            let detector = PredictionTable::from_detections(vec![
                Detection::new(pair[0], "typed", 0.9, [4.0, 4.0, 30.0, 20.0]),
                Detection::new(pair[1], "typed", 0.9, [4.0, 4.0, 30.0, 20.0]),
            ]);
            let orchestrator = Orchestrator::new(PipelineConfig::default()).unwrap();
            let err = orchestrator.crop_only(&input, &out, &detector).unwrap_err();

            assert!(matches!(
                err.downcast_ref::<PipelineError>(),
                Some(PipelineError::CropNameCollision { .. })
            ));
            assert!(!out.join("photos_cropped").exists());
        }
    }
}
