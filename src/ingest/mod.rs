//! Video sources.
//!
//! A source is opened from a `SourceSpec`, yields decoded frames one at a time
//! and is released exactly once by its owner:
//! - `stub://<name>?frames=N&fps=F&width=W&height=H`: synthetic scene (tests, demos)
//! - local file paths (feature: ingest-file-ffmpeg)
//! - capture devices by index, `device:N` or a bare `N` (feature: ingest-file-ffmpeg)
//!
//! Reading blocks until the next frame is decoded; `Ok(None)` is end of stream.

#[cfg(feature = "ingest-file-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod synthetic;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};

/// Where frames come from.
#[derive(Clone, Debug, PartialEq)]
pub enum SourceSpec {
    Path(PathBuf),
    Device(u32),
    Synthetic(SyntheticConfig),
}

impl SourceSpec {
    /// Parse a source description from configuration or a request.
    pub fn parse(value: &str) -> Result<Self> {
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("empty video source"));
        }
        if let Some(rest) = value.strip_prefix("stub://") {
            return Ok(SourceSpec::Synthetic(SyntheticConfig::parse(rest)?));
        }
        if let Some(index) = value.strip_prefix("device:") {
            let index = index
                .parse()
                .with_context(|| format!("invalid device index '{}'", index))?;
            return Ok(SourceSpec::Device(index));
        }
        if value.chars().all(|c| c.is_ascii_digit()) {
            return Ok(SourceSpec::Device(value.parse()?));
        }
        if value.contains("://") {
            return Err(anyhow!(
                "video sources must be local paths or devices (no URL schemes): {}",
                value
            ));
        }
        Ok(SourceSpec::Path(PathBuf::from(value)))
    }
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Path(path) => write!(f, "{}", path.display()),
            SourceSpec::Device(index) => write!(f, "device:{}", index),
            SourceSpec::Synthetic(cfg) => write!(f, "stub://{}", cfg.name),
        }
    }
}

/// An open, exclusively owned video source.
pub trait VideoSource: Send {
    /// Human-readable source description.
    fn describe(&self) -> String;

    /// Block until the next frame. `Ok(None)` means end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying handle. Further reads return `Ok(None)`.
    fn release(&mut self) {}
}

/// Open a source for reading.
pub fn open_source(spec: &SourceSpec) -> Result<Box<dyn VideoSource>> {
    match spec {
        SourceSpec::Synthetic(cfg) => Ok(Box::new(SyntheticSource::new(cfg.clone()))),
        SourceSpec::Path(path) => open_file(path),
        SourceSpec::Device(index) => open_device(*index),
    }
}

/// Frame dimensions of a source, taken from its first frame.
pub fn probe_dimensions(spec: &SourceSpec) -> Result<(u32, u32)> {
    let mut source = open_source(spec)?;
    let frame = source.read();
    source.release();
    let frame = frame?.ok_or_else(|| anyhow!("video source {} has no frames", spec))?;
    Ok((frame.width(), frame.height()))
}

fn open_file(path: &Path) -> Result<Box<dyn VideoSource>> {
    if !path.is_file() {
        return Err(anyhow!("video file {} does not exist", path.display()));
    }
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegSource::open_file(path)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow!(
            "file ingestion requires the ingest-file-ffmpeg feature ({})",
            path.display()
        ))
    }
}

fn open_device(index: u32) -> Result<Box<dyn VideoSource>> {
    #[cfg(feature = "ingest-file-ffmpeg")]
    {
        Ok(Box::new(file_ffmpeg::FfmpegSource::open_device(index)?))
    }
    #[cfg(not(feature = "ingest-file-ffmpeg"))]
    {
        Err(anyhow!(
            "device capture requires the ingest-file-ffmpeg feature (device:{})",
            index
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_descriptions() {
        assert_eq!(SourceSpec::parse("3").unwrap(), SourceSpec::Device(3));
        assert_eq!(SourceSpec::parse("device:0").unwrap(), SourceSpec::Device(0));
        assert_eq!(
            SourceSpec::parse("uploads/clip.mp4").unwrap(),
            SourceSpec::Path(PathBuf::from("uploads/clip.mp4"))
        );
        assert!(matches!(
            SourceSpec::parse("stub://demo?frames=3").unwrap(),
            SourceSpec::Synthetic(_)
        ));
        assert!(SourceSpec::parse("rtsp://camera").is_err());
        assert!(SourceSpec::parse("  ").is_err());
        assert!(SourceSpec::parse("device:x").is_err());
    }

    #[test]
    fn missing_file_fails_to_open() {
        let spec = SourceSpec::Path(PathBuf::from("/definitely/not/here.mp4"));
        assert!(open_source(&spec).is_err());
    }

    #[test]
    fn probes_synthetic_dimensions() {
        let spec = SourceSpec::parse("stub://probe?width=320&height=240&frames=2").unwrap();
        assert_eq!(probe_dimensions(&spec).unwrap(), (320, 240));
        assert_eq!(spec.to_string(), "stub://probe");
    }
}
