use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use image::{DynamicImage, ImageBuffer, Rgb};
use tempfile::tempdir;

use label_transcriber::detection::{Detection, PredictionTable};
use label_transcriber::ocr::{EngineFactory, OcrEngine, OcrOutput, QrReader, ThresholdMode};
use label_transcriber::pipeline::{load_json, Orchestrator, PipelineConfig, WorkerModel};
use label_transcriber::{PipelineError, TranscriptRecord};

struct FixedQr(Option<&'static str>);

impl QrReader for FixedQr {
    fn read(&self, _image: &DynamicImage) -> Option<String> {
        self.0.map(str::to_string)
    }
}

struct CountingEngine {
    text: String,
    calls: Arc<AtomicUsize>,
}

impl OcrEngine for CountingEngine {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn recognize(&mut self, _image: &DynamicImage) -> Result<OcrOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(OcrOutput::text(self.text.clone()))
    }
}

fn counting_factory(text: &str, calls: Arc<AtomicUsize>) -> Box<EngineFactory> {
    let text = text.to_string();
    Box::new(move || {
        Ok(Box::new(CountingEngine {
            text: text.clone(),
            calls: calls.clone(),
        }) as Box<dyn OcrEngine>)
    })
}

fn write_photo(dir: &Path, name: &str) {
    let img: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_fn(120, 90, |x, y| {
        if (y / 6) % 2 == 0 {
            Rgb([20, 20, 20])
        } else {
            Rgb([235, 230, 220 - (x % 10) as u8])
        }
    });
    img.save(dir.join(name)).unwrap();
}

/// Crop files below `dir`, relative to it, sorted.
fn crop_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current).unwrap() {
            let path = entry.unwrap().path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path.strip_prefix(dir).unwrap().to_path_buf());
            }
        }
    }
    files.sort();
    files
}

fn config(model: WorkerModel) -> PipelineConfig {
    let mut config = PipelineConfig::default();
    config.run.workers = 2;
    config.run.worker_model = model;
    config
}

#[test]
fn test_run_filters_crops_and_transcribes() {
    for model in [WorkerModel::Pool, WorkerModel::Threads] {
        let dir = tempdir().unwrap();
        let input = dir.path().join("drawer_12");
        let out = dir.path().join("out");
        std::fs::create_dir_all(&input).unwrap();
        write_photo(&input, "CAT0001_label.jpg");
        write_photo(&input, "CAT0002_label.jpg");
        write_photo(&input, "CAT0003.jpg");

        // CAT0003 has no detections at all
        let detector = PredictionTable::from_detections(vec![
            Detection::new("CAT0001_label.jpg", "typed", 0.9, [10.0, 10.0, 70.0, 40.0]),
            Detection::new("CAT0001_label.jpg", "typed", 0.6, [5.0, 50.0, 60.0, 80.0]),
            Detection::new("CAT0001_label.jpg", "handwritten", 0.95, [60.0, 45.0, 110.0, 85.0]),
            Detection::new("CAT0002_label.jpg", "typed", 0.85, [0.0, 0.0, 50.0, 30.0]),
            Detection::new("CAT0002_label.jpg", "typed", 0.99, [50.0, 30.0, 120.0, 90.0]),
        ]);

        let calls = Arc::new(AtomicUsize::new(0));
        let orchestrator = Orchestrator::new(config(model))
            .unwrap()
            .with_qr_reader(Box::new(FixedQr(None)));
        let factory = counting_factory("Coleoptera\nBerlin 1911", calls.clone());

        let summary = orchestrator
            .run(&input, &out, &detector, factory.as_ref())
            .unwrap();
        summary.save(&out.join("ocr_preprocessed.json")).unwrap();

        let ids: Vec<&str> = summary.records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "CAT0001_handwritten_1.jpg",
                "CAT0001_typed_1.jpg",
                "CAT0002_typed_1.jpg",
                "CAT0002_typed_2.jpg",
            ]
        );
        assert!(summary.records.iter().all(|r| r.text == "Coleoptera Berlin 1911"));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(summary.images, 3);
        assert_eq!(summary.stats.crops_written, 4);
        assert!(summary.failures.is_empty());

        assert_eq!(
            crop_files(&out.join("drawer_12_cropped")),
            vec![
                PathBuf::from("handwritten/CAT0001_handwritten_1.jpg"),
                PathBuf::from("typed/CAT0001_typed_1.jpg"),
                PathBuf::from("typed/CAT0002_typed_1.jpg"),
                PathBuf::from("typed/CAT0002_typed_2.jpg"),
            ]
        );

        let csv = std::fs::read_to_string(out.join("drawer_12_predictions.csv")).unwrap();
        assert_eq!(csv.lines().count(), 5);

        let saved: Vec<TranscriptRecord> = load_json(&out.join("ocr_preprocessed.json")).unwrap();
        assert_eq!(saved, summary.records);
    }
}

#[test]
fn test_nuri_is_rebuilt_from_crop_name() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("nuris");
    let out = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_photo(&input, "coll.mfn-berlin.de_u_43acfb_label.jpg");

    let detector = PredictionTable::from_detections(vec![Detection::new(
        "coll.mfn-berlin.de_u_43acfb_label.jpg",
        "nuri",
        0.99,
        [0.0, 0.0, 100.0, 60.0],
    )]);

    let orchestrator = Orchestrator::new(config(WorkerModel::Pool))
        .unwrap()
        .with_qr_reader(Box::new(FixedQr(None)));
    let factory = counting_factory("http:/ coll mfn-ber1in.de u 43acf6", Arc::new(AtomicUsize::new(0)));

    let summary = orchestrator
        .run(&input, &out, &detector, factory.as_ref())
        .unwrap();

    assert_eq!(summary.records.len(), 1);
    assert_eq!(summary.records[0].id, "coll.mfn-berlin.de_u_43acfb_nuri_1.jpg");
    assert_eq!(summary.records[0].text, "http://coll.mfn-berlin.de/u/43acfb");
    assert_eq!(summary.stats.nuri_corrected_count, 1);
}

#[test]
fn test_qr_crop_never_reaches_ocr() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("qr");
    let out = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_photo(&input, "B_label.jpg");

    let detector = PredictionTable::from_detections(vec![Detection::new(
        "B_label.jpg",
        "qr",
        0.97,
        [20.0, 20.0, 80.0, 80.0],
    )]);

    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(config(WorkerModel::Threads))
        .unwrap()
        .with_qr_reader(Box::new(FixedQr(Some("http://coll.mfn-berlin.de/u/9f00aa"))));
    let factory = counting_factory("unused", calls.clone());

    let summary = orchestrator
        .run(&input, &out, &detector, factory.as_ref())
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(summary.stats.qr_detected_count, 1);
    assert_eq!(summary.records[0].text, "http://coll.mfn-berlin.de/u/9f00aa");
}

#[test]
fn test_decoded_qr_payload_is_kept_verbatim() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("nuris");
    let out = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();
    write_photo(&input, "coll.mfn-berlin.de_u_43acfb_label.jpg");

    let detector = PredictionTable::from_detections(vec![Detection::new(
        "coll.mfn-berlin.de_u_43acfb_label.jpg",
        "nuri",
        0.99,
        [0.0, 0.0, 100.0, 60.0],
    )]);

    let calls = Arc::new(AtomicUsize::new(0));
    let orchestrator = Orchestrator::new(config(WorkerModel::Pool))
        .unwrap()
        .with_qr_reader(Box::new(FixedQr(Some("http://coll.mfn-berlin.de/u/ffff99"))));
    let factory = counting_factory("unused", calls.clone());

    let summary = orchestrator
        .run(&input, &out, &detector, factory.as_ref())
        .unwrap();

    assert_eq!(summary.records[0].text, "http://coll.mfn-berlin.de/u/ffff99");
    assert_eq!(summary.stats.qr_detected_count, 1);
    assert_eq!(summary.stats.nuri_corrected_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_empty_input_directory_is_fatal() {
    let dir = tempdir().unwrap();
    let input = dir.path().join("empty");
    let out = dir.path().join("out");
    std::fs::create_dir_all(&input).unwrap();

    let orchestrator = Orchestrator::new(PipelineConfig::default()).unwrap();
    let factory = counting_factory("unused", Arc::new(AtomicUsize::new(0)));
    let err = orchestrator
        .run(&input, &out, &PredictionTable::default(), factory.as_ref())
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::NoImages(_))
    ));
    assert!(!out.exists());
}

#[test]
fn test_invalid_block_size_is_rejected_before_any_work() {
    let mut config = PipelineConfig::default();
    config.transform.threshold_mode = ThresholdMode::AdaptiveMean;
    config.transform.block_size = Some(4);

    let err = Orchestrator::new(config).err().unwrap();

    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidBlockSize(4))
    ));
}
