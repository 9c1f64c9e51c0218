//! Persisting transcripts.
//!
//! The JSON result is written once, after all work is done, via a temporary
//! file and a rename. The backup log is append-only and opened per write so
//! completed transcripts survive a crash.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::transcript::TranscriptRecord;

/// Writes `value` as pretty JSON to `path`, replacing it atomically.
pub fn save_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize JSON")?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    fs::write(&tmp, json).context(format!("Failed to write {}", tmp.display()))?;
    fs::rename(&tmp, path).context(format!("Failed to move {} into place", tmp.display()))?;
    Ok(())
}

pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).context(format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&contents).context(format!("Failed to parse {}", path.display()))
}

/// Append-only `id<TAB>text` log.
#[derive(Debug, Clone)]
pub struct BackupLog {
    path: PathBuf,
}

impl BackupLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, record: &TranscriptRecord) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .context("Failed to open backup log for append")?;

        // One line per record; tabs and newlines in text would break the format
        let text = record.text.replace(['\t', '\n', '\r'], " ");
        writeln!(file, "{}\t{}", record.id, text).context("Failed to write backup log row")?;
        Ok(())
    }
}
