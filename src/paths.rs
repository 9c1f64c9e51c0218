use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::PipelineError;

const APP_DIR: &str = "label-transcriber";

/// Returns the per-user config file: `<config_dir>/label-transcriber/config.json`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_DIR).join("config.json"))
}

/// Returns the bundled language data directory: `<data_local_dir>/label-transcriber/tessdata/`
pub fn tessdata_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("tessdata")
}

/// `<out_dir>/<input dir name><suffix>`, e.g. `out/photos_cropped`.
pub fn derived_path(out_dir: &Path, input_dir: &Path, suffix: &str) -> PathBuf {
    let name = input_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "images".to_string());
    out_dir.join(format!("{}{}", name, suffix))
}

fn is_jpeg(path: &Path) -> bool {
    path.extension()
        .map(|e| {
            let e = e.to_string_lossy().to_ascii_lowercase();
            e == "jpg" || e == "jpeg"
        })
        .unwrap_or(false)
}

fn collect_jpegs(dir: &Path, recursive: bool, out: &mut Vec<PathBuf>) -> Result<()> {
    let entries =
        fs::read_dir(dir).context(format!("Failed to read directory: {}", dir.display()))?;
    for entry in entries {
        let path = entry.context("Failed to read directory entry")?.path();
        if path.is_dir() {
            if recursive {
                collect_jpegs(&path, true, out)?;
            }
        } else if is_jpeg(&path) {
            out.push(path);
        }
    }
    Ok(())
}

fn list_jpegs(dir: &Path, recursive: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(PipelineError::InputDirMissing(dir.to_path_buf()).into());
    }

    let mut images = Vec::new();
    collect_jpegs(dir, recursive, &mut images)?;
    if images.is_empty() {
        return Err(PipelineError::NoImages(dir.to_path_buf()).into());
    }

    images.sort();
    Ok(images)
}

/// `.jpg`/`.jpeg` files directly in `dir`, sorted.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    list_jpegs(dir, false)
}

/// `.jpg`/`.jpeg` files in `dir` and its class subdirectories, sorted.
pub fn list_crops(dir: &Path) -> Result<Vec<PathBuf>> {
    list_jpegs(dir, true)
}
