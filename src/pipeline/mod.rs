//! Run orchestration: configuration, the worker pool, and persisted output.

pub mod config;
pub mod output;
pub mod queue;
pub mod runner;
pub mod worker;

pub use config::{PipelineConfig, WorkerModel};
pub use output::{load_json, save_json, BackupLog};
pub use runner::{Failure, Orchestrator, RunStats, RunSummary};
