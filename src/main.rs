//! label-transcriber
//!
//! Command line front end: detection + cropping, QR/OCR, NURI correction
//! and transcript post-processing over directories of label photographs.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use label_transcriber::detection::{ParseMode, PredictionTable};
use label_transcriber::ocr::{engine_factory, BlankLabelFilter, ThresholdMode};
use label_transcriber::pipeline::config::{OcrBackend, OutputEncoding};
use label_transcriber::pipeline::{load_json, Orchestrator, PipelineConfig, RunSummary, WorkerModel};
use label_transcriber::postprocess::{write_split, TranscriptCleaner};
use label_transcriber::TranscriptRecord;

#[derive(Parser, Debug)]
#[command(name = "label-transcriber", version, about = "Transcribe museum specimen labels")]
struct Cli {
    /// JSON config file (default: <config dir>/label-transcriber/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,

    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Detect, crop, QR/OCR and correct every image in a directory
    Run {
        #[command(flatten)]
        detect: DetectArgs,
        #[command(flatten)]
        ocr: OcrArgs,
        #[command(flatten)]
        runner: RunnerArgs,
        /// Name of the transcript file written into the output directory
        #[arg(long, default_value = "ocr_preprocessed.json")]
        output_file: String,
    },
    /// Detect and crop only
    Crop {
        #[command(flatten)]
        detect: DetectArgs,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// QR/OCR a directory of existing crops
    Ocr {
        /// Crop directory (class subdirectories are included)
        #[arg(short, long)]
        dir: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        #[arg(long, default_value = "ocr_preprocessed.json")]
        output_file: String,
        #[command(flatten)]
        ocr: OcrArgs,
        #[command(flatten)]
        runner: RunnerArgs,
    },
    /// Split a transcript file into NURIs, empty and plausible transcripts
    Postprocess {
        /// Transcript JSON produced by `run` or `ocr`
        #[arg(short, long)]
        input: PathBuf,
        /// Output directory
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct DetectArgs {
    /// Directory of label photographs (.jpg/.jpeg)
    #[arg(short, long)]
    input: PathBuf,
    /// Detector output CSV (filename,class,score,xmin,ymin,xmax,ymax)
    #[arg(short, long)]
    predictions: PathBuf,
    /// Output directory
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
    /// Minimum detection confidence
    #[arg(long)]
    threshold: Option<f64>,
    /// Full class list of the detector, comma separated
    #[arg(long, value_delimiter = ',')]
    classes: Vec<String>,
    /// Write crops into one directory instead of one per class
    #[arg(long)]
    flat: bool,
    /// Fail on malformed numbers in the predictions instead of using 0
    #[arg(long)]
    strict: bool,
}

#[derive(Args, Debug)]
struct OcrArgs {
    /// Thresholding: 1 Otsu, 2 adaptive mean, 3 adaptive gaussian
    #[arg(short = 't', long, value_parser = clap::value_parser!(u8).range(1..=3))]
    thresholding: Option<u8>,
    /// Block size for adaptive thresholding (odd, >= 3)
    #[arg(short, long)]
    blocksize: Option<u32>,
    /// Constant subtracted from the local mean
    #[arg(short = 'c', long)]
    c_value: Option<f64>,
    #[arg(long, value_enum)]
    backend: Option<BackendArg>,
    /// Tesseract languages, `+`-joined
    #[arg(long)]
    languages: Option<String>,
    /// Drop non-ASCII characters from transcripts
    #[arg(long)]
    ascii: bool,
    /// Leave crops without any dark pixels out of OCR
    #[arg(long)]
    skip_blank: bool,
}

#[derive(Args, Debug)]
struct RunnerArgs {
    /// Number of workers
    #[arg(short, long)]
    workers: Option<usize>,
    #[arg(long, value_enum)]
    worker_model: Option<WorkerModelArg>,
    /// Append every transcript to this tab separated file as it completes
    #[arg(long)]
    backup_log: Option<PathBuf>,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum BackendArg {
    Tesseract,
    Vision,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum WorkerModelArg {
    Pool,
    Threads,
}

impl DetectArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(threshold) = self.threshold {
            config.detection.threshold = threshold;
        }
        if !self.classes.is_empty() {
            config.detection.classes = self.classes.clone();
        }
        if self.flat {
            config.detection.class_scoped = false;
        }
        if self.strict {
            config.detection.parse_mode = ParseMode::Strict;
        }
    }

    fn load_detector(&self, config: &PipelineConfig) -> Result<PredictionTable> {
        Ok(PredictionTable::from_csv(&self.predictions)?
            .with_classes(config.detection.classes.clone()))
    }
}

impl OcrArgs {
    fn apply(&self, config: &mut PipelineConfig) -> Result<()> {
        if let Some(index) = self.thresholding {
            config.transform.threshold_mode = ThresholdMode::from_index(index)
                .ok_or_else(|| anyhow!("Unknown thresholding mode {}", index))?;
        }
        if self.blocksize.is_some() {
            config.transform.block_size = self.blocksize;
        }
        if self.c_value.is_some() {
            config.transform.c = self.c_value;
        }
        if let Some(backend) = self.backend {
            config.ocr.backend = match backend {
                BackendArg::Tesseract => OcrBackend::Tesseract,
                BackendArg::Vision => OcrBackend::Vision,
            };
        }
        if let Some(languages) = &self.languages {
            config.ocr.languages = languages.clone();
        }
        if self.ascii {
            config.ocr.encoding = OutputEncoding::Ascii;
        }
        if self.skip_blank && config.ocr.blank_filter.is_none() {
            config.ocr.blank_filter = Some(BlankLabelFilter::default());
        }
        Ok(())
    }
}

impl RunnerArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(workers) = self.workers {
            config.run.workers = workers;
        }
        if let Some(model) = self.worker_model {
            config.run.worker_model = match model {
                WorkerModelArg::Pool => WorkerModel::Pool,
                WorkerModelArg::Threads => WorkerModel::Threads,
            };
        }
        if self.backup_log.is_some() {
            config.run.backup_log = self.backup_log.clone();
        }
    }
}

fn init_tracing(verbose: bool, quiet: bool) {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn save_summary(summary: &RunSummary, out_dir: &Path, output_file: &str) -> Result<()> {
    std::fs::create_dir_all(out_dir)
        .context(format!("Failed to create output directory: {}", out_dir.display()))?;
    let path = out_dir.join(output_file);
    summary.save(&path)?;
    info!(path = %path.display(), records = summary.records.len(), "Transcripts written");

    for failure in &summary.failures {
        warn!(image = %failure.image.display(), error = %failure.message, "Not transcribed");
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut config = PipelineConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Run {
            detect,
            ocr,
            runner,
            output_file,
        } => {
            detect.apply(&mut config);
            ocr.apply(&mut config)?;
            runner.apply(&mut config);

            let orchestrator = Orchestrator::new(config)?;
            let factory = engine_factory(&orchestrator.config().ocr)?;
            let detector = detect.load_detector(orchestrator.config())?;

            let summary = orchestrator.run(&detect.input, &detect.output, &detector, factory.as_ref())?;
            save_summary(&summary, &detect.output, &output_file)
        }
        Command::Crop { detect, runner } => {
            detect.apply(&mut config);
            runner.apply(&mut config);

            let orchestrator = Orchestrator::new(config)?;
            let detector = detect.load_detector(orchestrator.config())?;
            orchestrator.crop_only(&detect.input, &detect.output, &detector)?;
            Ok(())
        }
        Command::Ocr {
            dir,
            output,
            output_file,
            ocr,
            runner,
        } => {
            ocr.apply(&mut config)?;
            runner.apply(&mut config);

            let orchestrator = Orchestrator::new(config)?;
            let factory = engine_factory(&orchestrator.config().ocr)?;
            let preprocessed = orchestrator
                .config()
                .run
                .save_preprocessed
                .then(|| label_transcriber::paths::derived_path(&output, &dir, "_preprocessed"));

            let summary = orchestrator.ocr_directory(&dir, preprocessed.as_deref(), factory.as_ref())?;
            save_summary(&summary, &output, &output_file)
        }
        Command::Postprocess { input, output } => {
            let records: Vec<TranscriptRecord> = load_json(&input)?;
            let split = TranscriptCleaner::new()?.split(&records);
            write_split(&split, &output)
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
