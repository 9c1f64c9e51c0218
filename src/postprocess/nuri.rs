//! Canonicalization of NURI transcripts.
//!
//! A NURI is the museum's persistent specimen URI. OCR of a printed NURI is
//! rarely exact, but the identifier is also part of the crop file name, so
//! the URI can be rebuilt from the name.

use anyhow::Result;
use regex::Regex;

use crate::transcript::TranscriptRecord;

pub const NURI_BASE: &str = "http://coll.mfn-berlin.de/u/";

/// Fragments that mark a transcript as a (possibly garbled) NURI.
const NURI_TEXT_PATTERN: &str = r"/u/|http|u/|coll|mfn|/u|URI";

/// The identifier as it appears in file names, e.g. `_u_43acfb`.
const NURI_ID_PATTERN: &str = r"_u_[A-Za-z0-9]+";

#[derive(Debug, Clone)]
pub struct NuriCorrector {
    text_pattern: Regex,
    id_pattern: Regex,
}

impl NuriCorrector {
    pub fn new() -> Result<Self> {
        Ok(Self {
            text_pattern: Regex::new(NURI_TEXT_PATTERN)?,
            id_pattern: Regex::new(NURI_ID_PATTERN)?,
        })
    }

    pub fn looks_like_nuri(&self, text: &str) -> bool {
        self.text_pattern.is_match(text)
    }

    /// The bare identifier embedded in a crop id, without the `_u_` prefix.
    pub fn identifier<'a>(&self, id: &'a str) -> Option<&'a str> {
        self.id_pattern.find(id).map(|m| &m.as_str()[3..])
    }

    /// Rewrites NURI-like text to the canonical URI.
    ///
    /// Returns the record and whether its text changed. Records whose id
    /// carries no identifier are returned untouched.
    pub fn correct(&self, record: TranscriptRecord) -> (TranscriptRecord, bool) {
        if !self.looks_like_nuri(&record.text) {
            return (record, false);
        }
        let Some(identifier) = self.identifier(&record.id) else {
            return (record, false);
        };

        let canonical = format!("{}{}", NURI_BASE, identifier);
        if canonical == record.text {
            return (record, false);
        }

        (
            TranscriptRecord {
                text: canonical,
                ..record
            },
            true,
        )
    }
}
