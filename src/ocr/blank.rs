//! Crops without any text, recognized by their share of dark pixels.
//!
//! Only the inner part of a crop is counted; label borders and shadows at
//! the edges are ignored.

use image::imageops;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BlankLabelFilter {
    /// Crops with a smaller share of dark pixels are blank
    #[serde(default = "default_min_dark_ratio")]
    pub min_dark_ratio: f64,
    /// Fraction of width and height left out at each edge
    #[serde(default = "default_margin")]
    pub margin: f64,
    /// Mean RGB value below which a pixel is dark
    #[serde(default = "default_dark_level")]
    pub dark_level: u8,
}

fn default_min_dark_ratio() -> f64 {
    0.01
}

fn default_margin() -> f64 {
    0.1
}

fn default_dark_level() -> u8 {
    100
}

impl Default for BlankLabelFilter {
    fn default() -> Self {
        Self {
            min_dark_ratio: default_min_dark_ratio(),
            margin: default_margin(),
            dark_level: default_dark_level(),
        }
    }
}

impl BlankLabelFilter {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if !(0.0..=1.0).contains(&self.min_dark_ratio) {
            return Err(PipelineError::InvalidBlankFilter(format!(
                "dark pixel ratio must lie in [0, 1], got {}",
                self.min_dark_ratio
            )));
        }
        if !(0.0..0.5).contains(&self.margin) {
            return Err(PipelineError::InvalidBlankFilter(format!(
                "margin must lie in [0, 0.5), got {}",
                self.margin
            )));
        }
        Ok(())
    }

    /// Share of dark pixels inside the margins. A crop too small to have an
    /// inner part is counted whole; an empty crop has ratio 0.
    pub fn dark_ratio(&self, image: &DynamicImage) -> f64 {
        let rgb = image.to_rgb8();
        let (w, h) = rgb.dimensions();
        if w == 0 || h == 0 {
            return 0.0;
        }

        let x0 = (w as f64 * self.margin) as u32;
        let y0 = (h as f64 * self.margin) as u32;
        let (x0, y0) = if 2 * x0 < w && 2 * y0 < h { (x0, y0) } else { (0, 0) };
        let inner = imageops::crop_imm(&rgb, x0, y0, w - 2 * x0, h - 2 * y0).to_image();

        let level = self.dark_level as u32 * 3;
        let dark = inner
            .pixels()
            .filter(|p| (p[0] as u32 + p[1] as u32 + p[2] as u32) < level)
            .count();

        dark as f64 / (inner.width() * inner.height()) as f64
    }

    pub fn is_blank(&self, image: &DynamicImage) -> bool {
        self.dark_ratio(image) < self.min_dark_ratio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    fn paper_with_text(text_rows: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(ImageBuffer::from_fn(100, 50, |x, y| {
            if y >= 20 && y < 20 + text_rows && (20..80).contains(&x) {
                Rgb([30, 30, 30])
            } else {
                Rgb([240, 235, 220])
            }
        }))
    }

    #[test]
    fn test_plain_paper_is_blank() {
        let filter = BlankLabelFilter::default();

        assert_eq!(filter.dark_ratio(&paper_with_text(0)), 0.0);
        assert!(filter.is_blank(&paper_with_text(0)));
    }

    #[test]
    fn test_printed_line_is_not_blank() {
        let filter = BlankLabelFilter::default();

        // 4 rows of 60 dark pixels inside an 80x40 inner area
        let ratio = filter.dark_ratio(&paper_with_text(4));
        assert!((ratio - 240.0 / 3200.0).abs() < 1e-9);
        assert!(!filter.is_blank(&paper_with_text(4)));
    }

    #[test]
    fn test_dark_border_is_ignored() {
        let bordered = DynamicImage::ImageRgb8(ImageBuffer::from_fn(100, 100, |x, y| {
            if x < 5 || y < 5 || x >= 95 || y >= 95 {
                Rgb([0, 0, 0])
            } else {
                Rgb([250, 250, 250])
            }
        }));

        assert!(BlankLabelFilter::default().is_blank(&bordered));
    }

    #[test]
    fn test_empty_crop_is_blank() {
        let empty = DynamicImage::new_rgb8(0, 0);

        assert!(BlankLabelFilter::default().is_blank(&empty));
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let bad_margin = BlankLabelFilter {
            margin: 0.5,
            ..BlankLabelFilter::default()
        };
        let bad_ratio = BlankLabelFilter {
            min_dark_ratio: 1.5,
            ..BlankLabelFilter::default()
        };

        assert!(bad_margin.validate().is_err());
        assert!(bad_ratio.validate().is_err());
        assert!(BlankLabelFilter::default().validate().is_ok());
    }
}
