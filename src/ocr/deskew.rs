//! Skew estimation and canvas-expanding rotation.
//!
//! The skew angle is the dominant orientation of straight edges (text
//! baselines, label borders) found with a Hough transform. Positive angles
//! mean the content is rotated clockwise.

use std::borrow::Cow;
use std::collections::BTreeMap;

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometric_transformations::{rotate_about_center, Interpolation};
use imageproc::hough::{detect_lines, LineDetectionOptions};
use tracing::debug;

use crate::error::PipelineError;

/// Crops smaller than this on either side are not analysed.
const MIN_SIDE: u32 = 16;

/// Larger crops are downscaled before edge detection.
const MAX_SIDE: u32 = 1024;

const CANNY_LOW: f32 = 50.0;
const CANNY_HIGH: f32 = 150.0;
const MIN_VOTES: u32 = 20;
const SUPPRESSION_RADIUS: u32 = 8;

/// Accepted skew range in degrees, inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewBounds {
    pub min_angle: f32,
    pub max_angle: f32,
}

impl SkewBounds {
    pub fn new(min_angle: f32, max_angle: f32) -> Result<Self, PipelineError> {
        if min_angle >= max_angle {
            return Err(PipelineError::InvalidAngleRange {
                min: min_angle,
                max: max_angle,
            });
        }
        Ok(Self { min_angle, max_angle })
    }

    fn contains(&self, angle: f32) -> bool {
        angle >= self.min_angle && angle <= self.max_angle
    }
}

impl Default for SkewBounds {
    fn default() -> Self {
        Self {
            min_angle: -45.0,
            max_angle: 45.0,
        }
    }
}

/// Estimates the skew of `gray` in whole degrees.
///
/// Returns `None` when the image is too small or no line inside `bounds`
/// was found. When several orientations tie, the one closest to level wins.
pub fn estimate_skew(gray: &GrayImage, bounds: &SkewBounds) -> Option<f32> {
    let (w, h) = gray.dimensions();
    if w < MIN_SIDE || h < MIN_SIDE {
        return None;
    }

    let scaled: Cow<GrayImage> = if w.max(h) > MAX_SIDE {
        let factor = MAX_SIDE as f32 / w.max(h) as f32;
        let nw = ((w as f32 * factor) as u32).max(1);
        let nh = ((h as f32 * factor) as u32).max(1);
        Cow::Owned(imageops::resize(gray, nw, nh, FilterType::Triangle))
    } else {
        Cow::Borrowed(gray)
    };

    let blurred = gaussian_blur_f32(&scaled, 1.0);
    let edges = canny(&blurred, CANNY_LOW, CANNY_HIGH);
    let options = LineDetectionOptions {
        vote_threshold: (scaled.width().max(scaled.height()) / 4).max(MIN_VOTES),
        suppression_radius: SUPPRESSION_RADIUS,
    };
    let lines = detect_lines(&edges, options);

    // Hough angles are those of the line normal; a level line has 90
    let mut votes: BTreeMap<i32, usize> = BTreeMap::new();
    for line in &lines {
        let skew = line.angle_in_degrees as i32 - 90;
        if bounds.contains(skew as f32) {
            *votes.entry(skew).or_default() += 1;
        }
    }

    let best = votes
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then(b.0.abs().cmp(&a.0.abs())))
        .map(|(angle, _)| angle as f32);

    debug!(lines = lines.len(), skew = ?best, "Estimated skew");
    best
}

/// Rotates clockwise by `degrees` on a canvas large enough to keep every
/// corner, filling uncovered area with `background`.
pub fn rotate_expand(image: &GrayImage, degrees: f32, background: u8) -> GrayImage {
    let (w, h) = image.dimensions();
    if degrees == 0.0 || w == 0 || h == 0 {
        return image.clone();
    }

    let theta = degrees.to_radians();
    let (sin, cos) = (theta.sin().abs(), theta.cos().abs());
    let canvas_w = ((w as f32 * cos + h as f32 * sin).ceil() as u32).max(w);
    let canvas_h = ((w as f32 * sin + h as f32 * cos).ceil() as u32).max(h);

    let mut canvas = GrayImage::from_pixel(canvas_w, canvas_h, Luma([background]));
    imageops::overlay(
        &mut canvas,
        image,
        ((canvas_w - w) / 2) as i64,
        ((canvas_h - h) / 2) as i64,
    );

    rotate_about_center(&canvas, theta, Interpolation::Bilinear, Luma([background]))
}
