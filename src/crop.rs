//! Cropping accepted boxes out of source images.
//!
//! Crops are named `{stem}_{class}_{occurrence}.jpg` where `stem` is the
//! source file stem with any `_label` marker removed, and `occurrence` counts
//! boxes of the same class in the same image starting at 1.

use anyhow::{Context, Result};
use image::{DynamicImage, RgbImage};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::detection::AcceptedBox;

/// One or more underscores followed by `label`, as in `B123__label.jpg`.
const LABEL_MARKER: &str = r"_+label";

/// A crop of one accepted box.
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub source_image_id: String,
    pub class_label: String,
    /// 1-based index among boxes of the same class in the same image
    pub occurrence_index: u32,
    pub image: DynamicImage,
    /// Where the crop was written
    pub path: PathBuf,
}

impl CroppedImage {
    /// File name of the written crop, used as the transcript id.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }
}

/// Writes crops below an output root, optionally one directory per class.
#[derive(Debug, Clone)]
pub struct Cropper {
    output_root: PathBuf,
    class_scoped: bool,
    label_marker: Regex,
}

impl Cropper {
    pub fn new(output_root: impl Into<PathBuf>, class_scoped: bool) -> Result<Self> {
        Ok(Self {
            output_root: output_root.into(),
            class_scoped,
            label_marker: Regex::new(LABEL_MARKER)?,
        })
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Creates the output root and, when class scoped, one directory per
    /// class. Idempotent.
    pub fn prepare_dirs<S: AsRef<str>>(&self, classes: &[S]) -> Result<()> {
        fs::create_dir_all(&self.output_root).context(format!(
            "Failed to create output directory: {}",
            self.output_root.display()
        ))?;

        if self.class_scoped {
            for class in classes {
                let dir = self.output_root.join(class.as_ref());
                fs::create_dir_all(&dir)
                    .context(format!("Failed to create class directory: {}", dir.display()))?;
            }
        }

        Ok(())
    }

    /// Crop file name for a box, e.g. `B12_typed_2.jpg`.
    pub fn crop_file_name(&self, source_image_id: &str, class_label: &str, occurrence: u32) -> String {
        let stem = Path::new(source_image_id)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| source_image_id.to_string());
        let stem = self.label_marker.replace_all(&stem, "");

        format!("{}_{}_{}.jpg", stem, class_label, occurrence)
    }

    fn crop_path(&self, class_label: &str, file_name: &str) -> PathBuf {
        if self.class_scoped {
            self.output_root.join(class_label).join(file_name)
        } else {
            self.output_root.join(file_name)
        }
    }

    /// Crops every box out of `image` and writes each crop to disk.
    ///
    /// All class directories are created before the first crop is written.
    /// Boxes are clipped at the image edge; a box that ends up empty is
    /// recorded and written as a zero-byte file.
    pub fn crop(
        &self,
        image: &DynamicImage,
        source_image_id: &str,
        boxes: &[AcceptedBox],
    ) -> Result<Vec<CroppedImage>> {
        let classes: Vec<&str> = boxes.iter().map(|b| b.class_label.as_str()).collect();
        self.prepare_dirs(&classes)?;

        let rgb = image.to_rgb8();
        let mut occurrences: HashMap<&str, u32> = HashMap::new();
        let mut crops = Vec::with_capacity(boxes.len());

        for b in boxes {
            let occurrence = occurrences.entry(b.class_label.as_str()).or_insert(0);
            *occurrence += 1;

            let file_name = self.crop_file_name(source_image_id, &b.class_label, *occurrence);
            let path = self.crop_path(&b.class_label, &file_name);
            let sub = slice(&rgb, b);

            if sub.width() == 0 || sub.height() == 0 {
                warn!(
                    image = source_image_id,
                    class = %b.class_label,
                    xmin = b.xmin,
                    ymin = b.ymin,
                    xmax = b.xmax,
                    ymax = b.ymax,
                    "Empty crop, writing placeholder file"
                );
                File::create(&path)
                    .context(format!("Failed to create crop file: {}", path.display()))?;
            } else {
                sub.save(&path)
                    .context(format!("Failed to save crop: {}", path.display()))?;
                debug!(path = %path.display(), "Saved crop");
            }

            crops.push(CroppedImage {
                source_image_id: source_image_id.to_string(),
                class_label: b.class_label.clone(),
                occurrence_index: *occurrence,
                image: DynamicImage::ImageRgb8(sub),
                path,
            });
        }

        Ok(crops)
    }
}

/// `image[ymin:ymax, xmin:xmax]`, ending at the image edge.
fn slice(image: &RgbImage, b: &AcceptedBox) -> RgbImage {
    let (w, h) = image.dimensions();
    let x0 = b.xmin.min(w);
    let y0 = b.ymin.min(h);
    let x1 = b.xmax.min(w);
    let y1 = b.ymax.min(h);

    image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image()
}
