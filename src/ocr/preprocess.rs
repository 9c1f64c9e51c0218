//! Normalization steps applied to a crop before OCR.
//!
//! Every step takes an image by reference and returns a new one. The
//! canonical chain is: skew estimate on the raw grayscale, grayscale, blur,
//! threshold, optional extra steps, rotation by the negated skew.

use image::{DynamicImage, GrayImage, ImageBuffer, Luma};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::{median_filter, separable_filter_equal};
use imageproc::map::{map_colors, map_colors2};
use imageproc::morphology;
use serde::{Deserialize, Serialize};

use super::deskew::{estimate_skew, rotate_expand, SkewBounds};
use crate::error::PipelineError;
use crate::pipeline::config::TransformConfig;

/// Binarization strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMode {
    /// Global threshold chosen by Otsu's method
    #[default]
    Otsu,
    /// Local mean of a `block_size` square minus `c`
    AdaptiveMean,
    /// Gaussian-weighted local mean minus `c`
    AdaptiveGaussian,
}

impl ThresholdMode {
    /// Maps the command line numbering `1 | 2 | 3`.
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            1 => Some(Self::Otsu),
            2 => Some(Self::AdaptiveMean),
            3 => Some(Self::AdaptiveGaussian),
            _ => None,
        }
    }

    /// `(block_size, c)` used when not overridden. Otsu has none.
    pub fn default_params(self) -> Option<(u32, f64)> {
        match self {
            Self::Otsu => None,
            Self::AdaptiveMean => Some((11, 2.0)),
            Self::AdaptiveGaussian => Some((15, 4.0)),
        }
    }
}

/// A validated thresholding step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Threshold {
    mode: ThresholdMode,
    block_size: u32,
    c: f64,
}

impl Threshold {
    /// Resolves per-mode defaults and checks the block size.
    ///
    /// Overrides are ignored for Otsu.
    pub fn new(
        mode: ThresholdMode,
        block_size: Option<u32>,
        c: Option<f64>,
    ) -> Result<Self, PipelineError> {
        let Some((default_block, default_c)) = mode.default_params() else {
            return Ok(Self { mode, block_size: 0, c: 0.0 });
        };

        let block_size = block_size.unwrap_or(default_block);
        if block_size < 3 || block_size % 2 == 0 {
            return Err(PipelineError::InvalidBlockSize(block_size));
        }

        Ok(Self {
            mode,
            block_size,
            c: c.unwrap_or(default_c),
        })
    }

    pub fn mode(&self) -> ThresholdMode {
        self.mode
    }

    pub fn apply(&self, gray: &GrayImage) -> GrayImage {
        match self.mode {
            ThresholdMode::Otsu => threshold(gray, otsu_level(gray), ThresholdType::Binary),
            ThresholdMode::AdaptiveMean => {
                let kernel = vec![1.0 / self.block_size as f32; self.block_size as usize];
                self.adaptive(gray, &kernel)
            }
            ThresholdMode::AdaptiveGaussian => {
                self.adaptive(gray, &gaussian_kernel(self.block_size))
            }
        }
    }

    /// White where the pixel is brighter than its local mean minus `c`.
    fn adaptive(&self, gray: &GrayImage, kernel: &[f32]) -> GrayImage {
        let means = local_means(gray, kernel);
        let delta = self.c.ceil() as i32;

        map_colors2(gray, &means, |p, mean| {
            let keep = p[0] as i32 - mean[0].round() as i32 > -delta;
            Luma([if keep { 255 } else { 0 }])
        })
    }
}

/// Extra morphology selectable after thresholding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtraStep {
    Median,
    Dilate,
    Erode,
}

impl ExtraStep {
    pub fn apply(self, image: &GrayImage) -> GrayImage {
        match self {
            Self::Median => median(image),
            Self::Dilate => dilate(image),
            Self::Erode => erode(image),
        }
    }
}

pub fn grayscale(image: &DynamicImage) -> GrayImage {
    image.to_luma8()
}

/// Gaussian blur with a `kernel_size` square kernel.
pub fn blur(gray: &GrayImage, kernel_size: u32) -> GrayImage {
    if kernel_size <= 1 {
        return gray.clone();
    }

    let blurred = local_means(gray, &gaussian_kernel(kernel_size));
    map_colors(&blurred, |v| Luma([v[0].round().clamp(0.0, 255.0) as u8]))
}

/// 5x5 median.
pub fn median(gray: &GrayImage) -> GrayImage {
    median_filter(gray, 2, 2)
}

/// Max over a 5x5 square.
pub fn dilate(gray: &GrayImage) -> GrayImage {
    morphology::dilate(gray, Norm::LInf, 2)
}

/// Min over a 5x5 square.
pub fn erode(gray: &GrayImage) -> GrayImage {
    morphology::erode(gray, Norm::LInf, 2)
}

/// Normalized 1-D Gaussian of odd `size`. Sigma follows the OpenCV rule for
/// an unspecified sigma.
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (size / 2) as f32;
    let weights: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-(d * d) / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = weights.iter().sum();
    weights.into_iter().map(|w| w / sum).collect()
}

/// Weighted local mean under the outer product of `kernel` with itself,
/// kept in float so flat regions survive unchanged. Edge pixels repeat.
fn local_means(gray: &GrayImage, kernel: &[f32]) -> ImageBuffer<Luma<f32>, Vec<f32>> {
    let plane: ImageBuffer<Luma<f32>, Vec<f32>> = map_colors(gray, |p| Luma([p[0] as f32]));
    separable_filter_equal(&plane, kernel)
}

/// A crop after normalization, tagged with the crop it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    pub file_name: String,
    pub image: GrayImage,
    /// Rotation that was undone, in degrees
    pub skew: f32,
}

/// The configured normalization chain.
#[derive(Debug, Clone)]
pub struct TransformChain {
    blur_kernel: u32,
    threshold: Threshold,
    bounds: SkewBounds,
    background: u8,
    extra_steps: Vec<ExtraStep>,
}

impl TransformChain {
    pub fn from_config(config: &TransformConfig) -> Result<Self, PipelineError> {
        if config.blur_kernel == 0 || config.blur_kernel % 2 == 0 {
            return Err(PipelineError::InvalidBlurKernel(config.blur_kernel));
        }

        Ok(Self {
            blur_kernel: config.blur_kernel,
            threshold: Threshold::new(config.threshold_mode, config.block_size, config.c)?,
            bounds: SkewBounds::new(config.min_angle, config.max_angle)?,
            background: config.background,
            extra_steps: config.extra_steps.clone(),
        })
    }

    pub fn threshold(&self) -> &Threshold {
        &self.threshold
    }

    pub fn apply(&self, file_name: &str, image: &DynamicImage) -> NormalizedImage {
        let gray = grayscale(image);
        let skew = estimate_skew(&gray, &self.bounds).unwrap_or(0.0);

        let blurred = blur(&gray, self.blur_kernel);
        let mut binary = self.threshold.apply(&blurred);
        for step in &self.extra_steps {
            binary = step.apply(&binary);
        }

        NormalizedImage {
            file_name: file_name.to_string(),
            image: rotate_expand(&binary, -skew, self.background),
            skew,
        }
    }
}
