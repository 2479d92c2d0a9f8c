//! Wire encoding for annotated frames.
//!
//! Frames leave the pipeline as JPEG parts of a
//! `multipart/x-mixed-replace; boundary=frame` body.

use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;

use crate::error::StreamError;

pub const BOUNDARY: &str = "frame";
pub const STREAM_CONTENT_TYPE: &str = "multipart/x-mixed-replace; boundary=frame";
pub const DEFAULT_JPEG_QUALITY: u8 = 80;

/// Turns an annotated image into the bytes of one wire frame.
pub trait FrameEncoder: Send {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>, StreamError>;
}

/// Baseline JPEG encoder.
#[derive(Clone, Copy, Debug)]
pub struct JpegFrameEncoder {
    quality: u8,
}

impl JpegFrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
        }
    }

    pub fn quality(&self) -> u8 {
        self.quality
    }
}

impl Default for JpegFrameEncoder {
    fn default() -> Self {
        Self::new(DEFAULT_JPEG_QUALITY)
    }
}

impl FrameEncoder for JpegFrameEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>, StreamError> {
        encode_jpeg(image, self.quality)
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, StreamError> {
    if image.width() == 0 || image.height() == 0 {
        return Err(StreamError::Encode("image has no pixels".to_string()));
    }
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| StreamError::Encode(e.to_string()))?;
    Ok(buffer)
}

/// Wrap one JPEG as a multipart part: `--frame`, part header, bytes, CRLF.
pub fn multipart_chunk(jpeg: &[u8]) -> Vec<u8> {
    let header = format!("--{}\r\nContent-Type: image/jpeg\r\n\r\n", BOUNDARY);
    let mut chunk = Vec::with_capacity(header.len() + jpeg.len() + 2);
    chunk.extend_from_slice(header.as_bytes());
    chunk.extend_from_slice(jpeg);
    chunk.extend_from_slice(b"\r\n");
    chunk
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn encodes_jpeg_with_soi_marker() {
        let image = RgbImage::from_pixel(16, 8, Rgb([10, 200, 30]));
        let jpeg = JpegFrameEncoder::new(90).encode(&image).unwrap();
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);
    }

    #[test]
    fn empty_image_is_an_encode_failure() {
        let err = encode_jpeg(&RgbImage::new(0, 0), 80).unwrap_err();
        assert!(matches!(err, StreamError::Encode(_)));
    }

    #[test]
    fn chunk_framing() {
        let chunk = multipart_chunk(b"JPEG");
        assert_eq!(
            chunk,
            b"--frame\r\nContent-Type: image/jpeg\r\n\r\nJPEG\r\n".to_vec()
        );
        assert_eq!(JpegFrameEncoder::new(0).quality(), 1);
        assert_eq!(JpegFrameEncoder::new(255).quality(), 100);
    }
}
