//! Decoded video frames.
//!
//! A `Frame` is an RGB8 image tagged with its 0-based position in the source.
//! Frames are produced by `ingest` sources, read by inference engines, and
//! copied (never mutated) by the annotator.

use anyhow::{anyhow, Result};
use image::RgbImage;

/// One decoded RGB frame.
#[derive(Clone, Debug)]
pub struct Frame {
    image: RgbImage,
    index: u64,
}

impl Frame {
    /// Build a frame from packed RGB24 bytes.
    pub fn new(pixels: Vec<u8>, width: u32, height: u32, index: u64) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not fit {}x{}", width, height))?;
        Ok(Self { image, index })
    }

    pub fn from_image(image: RgbImage, index: u64) -> Self {
        Self { image, index }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Position of this frame in its source, starting at 0.
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixel bytes, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }
}
