//! Local file and capture-device source using FFmpeg.
//!
//! Frames are decoded in-memory and converted to RGB24. End of file flushes
//! the decoder before reporting end of stream.

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;

use super::VideoSource;
use crate::frame::Frame;

pub(crate) struct FfmpegSource {
    description: String,
    input: ffmpeg::format::context::Input,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
    eof_sent: bool,
    released: bool,
}

impl FfmpegSource {
    pub(crate) fn open_file(path: &Path) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        let input = ffmpeg::format::input(&path)
            .with_context(|| format!("failed to open file input '{}' with ffmpeg", path.display()))?;
        Self::from_input(input, path.display().to_string())
    }

    pub(crate) fn open_device(index: u32) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        ffmpeg::device::register_all();
        let device_path = format!("/dev/video{}", index);
        let format = ffmpeg::device::input::video()
            .find(|fmt| fmt.name() == "video4linux2,v4l2" || fmt.name() == "v4l2")
            .ok_or_else(|| anyhow!("ffmpeg has no video4linux2 input device support"))?;
        let context = ffmpeg::format::open_with(
            &device_path,
            &ffmpeg::Format::Input(format),
            ffmpeg::Dictionary::new(),
        )
        .with_context(|| format!("failed to open capture device {}", device_path))?;
        Self::from_input(context.input(), format!("device:{}", index))
    }

    fn from_input(input: ffmpeg::format::context::Input, description: String) -> Result<Self> {
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow!("{} has no video track", description))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("FfmpegSource: opened {}", description);
        Ok(Self {
            description,
            input,
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
            eof_sent: false,
            released: false,
        })
    }

    fn convert(&mut self, decoded: &ffmpeg::frame::Video) -> Result<Frame> {
        let mut rgb_frame = ffmpeg::frame::Video::empty();
        self.scaler
            .run(decoded, &mut rgb_frame)
            .context("scale frame to RGB")?;
        let (pixels, width, height) = frame_to_pixels(&rgb_frame)?;
        let frame = Frame::new(pixels, width, height, self.frame_count)?;
        self.frame_count += 1;
        Ok(frame)
    }
}

impl VideoSource for FfmpegSource {
    fn describe(&self) -> String {
        self.description.clone()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        let mut decoded = ffmpeg::frame::Video::empty();
        loop {
            if self.decoder.receive_frame(&mut decoded).is_ok() {
                return self.convert(&decoded).map(Some);
            }
            if self.eof_sent {
                return Ok(None);
            }
            let next = self
                .input
                .packets()
                .next()
                .map(|(stream, packet)| (stream.index(), packet));
            match next {
                Some((index, packet)) if index == self.stream_index => {
                    self.decoder
                        .send_packet(&packet)
                        .context("send packet to ffmpeg decoder")?;
                }
                Some(_) => continue,
                None => {
                    self.decoder.send_eof().context("flush ffmpeg decoder")?;
                    self.eof_sent = true;
                }
            }
        }
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::debug!(
                "FfmpegSource: released {} after {} frames",
                self.description,
                self.frame_count
            );
        }
    }
}

fn frame_to_pixels(frame: &ffmpeg::frame::Video) -> Result<(Vec<u8>, u32, u32)> {
    let width = frame.width();
    let height = frame.height();
    let row_bytes = (width as usize) * 3;
    let stride = frame.stride(0);
    let data = frame.data(0);

    if stride == row_bytes {
        let packed = data
            .get(..row_bytes * height as usize)
            .context("ffmpeg frame buffer is shorter than its dimensions")?;
        return Ok((packed.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(
            data.get(start..end)
                .context("ffmpeg frame row is out of bounds")?,
        );
    }

    Ok((pixels, width, height))
}
