//! Transcript post-processing: NURI canonicalization during a run, and
//! splitting/cleaning of a finished transcript collection.

pub mod nuri;
pub mod transcripts;

pub use nuri::NuriCorrector;
pub use transcripts::{write_split, TranscriptCleaner, TranscriptSplit};
