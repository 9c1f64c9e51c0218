//! QR code decoding for labels that carry their identifier as a code.

use image::DynamicImage;
use rqrr::PreparedImage;
use tracing::debug;

/// Decodes a QR payload from a crop.
pub trait QrReader: Send + Sync {
    /// Returns the first non-empty payload found, if any.
    fn read(&self, image: &DynamicImage) -> Option<String>;
}

/// Grid detection and decoding via `rqrr`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RqrrReader;

impl QrReader for RqrrReader {
    fn read(&self, image: &DynamicImage) -> Option<String> {
        if image.width() == 0 || image.height() == 0 {
            return None;
        }

        let mut prepared = PreparedImage::prepare(image.to_luma8());
        let grids = prepared.detect_grids();
        debug!(grids = grids.len(), "QR grid detection");

        grids.into_iter().find_map(|grid| match grid.decode() {
            Ok((_, content)) if !content.is_empty() => Some(content),
            _ => None,
        })
    }
}
