//! Turns photographs of specimen labels into transcripts.
//!
//! Detector output is filtered and cropped, each crop is either decoded as a
//! QR code or normalized and run through OCR, NURI transcripts are rebuilt
//! from the crop name, and the records of a run are written as one JSON
//! array.

pub mod crop;
pub mod detection;
pub mod error;
pub mod ocr;
pub mod paths;
pub mod pipeline;
pub mod postprocess;
pub mod transcript;

pub use error::PipelineError;
pub use transcript::{TranscriptRecord, WordBox};
