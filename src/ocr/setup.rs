//! Locating the Tesseract executable and its language data.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::error::PipelineError;
use crate::paths;

/// Install locations checked when `tesseract` is not on PATH.
const COMMON_PATHS: [&str; 4] = [
    "/usr/bin/tesseract",
    "/usr/local/bin/tesseract",
    "/opt/homebrew/bin/tesseract",
    r"C:\Program Files\Tesseract-OCR\tesseract.exe",
];

/// Returns true if `executable --version` runs and exits successfully.
fn responds_to_version(executable: &Path) -> bool {
    Command::new(executable)
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

/// Finds a working Tesseract executable.
///
/// Checks the configured path first, then PATH, then common install
/// locations. Fails with `EngineNotFound` if none answers `--version`.
pub fn locate_tesseract(configured: Option<&Path>) -> Result<PathBuf, PipelineError> {
    if let Some(path) = configured {
        if responds_to_version(path) {
            info!(path = %path.display(), "Using configured Tesseract");
            return Ok(path.to_path_buf());
        }
        return Err(PipelineError::EngineNotFound(format!(
            "configured tesseract at {} does not run",
            path.display()
        )));
    }

    let on_path = PathBuf::from("tesseract");
    if responds_to_version(&on_path) {
        debug!("Found Tesseract in PATH");
        return Ok(on_path);
    }

    for candidate in COMMON_PATHS {
        let p = PathBuf::from(candidate);
        if p.exists() && responds_to_version(&p) {
            info!(path = %p.display(), "Found Tesseract");
            return Ok(p);
        }
    }

    Err(PipelineError::EngineNotFound(
        "tesseract not found in PATH or common install locations".to_string(),
    ))
}

/// Finds a tessdata directory holding every requested language.
///
/// `languages` is Tesseract's `+`-joined form, e.g. `eng+deu`. Returns
/// `None` when no candidate has them all, leaving Tesseract to use its
/// built-in default location.
pub fn find_tessdata_dir(languages: &str) -> Option<PathBuf> {
    let mut candidates = vec![paths::tessdata_dir()];
    if let Ok(prefix) = std::env::var("TESSDATA_PREFIX") {
        let prefix = PathBuf::from(prefix);
        candidates.push(prefix.join("tessdata"));
        candidates.push(prefix);
    }

    candidates.into_iter().find(|dir| has_languages(dir, languages))
}

fn has_languages(dir: &Path, languages: &str) -> bool {
    languages
        .split('+')
        .filter(|l| !l.is_empty())
        .all(|lang| dir.join(format!("{}.traineddata", lang)).exists())
}
