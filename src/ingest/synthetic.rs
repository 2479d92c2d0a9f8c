//! Synthetic frame source (`stub://`) for tests and demos.
//!
//! Renders a small deterministic scene: a standing figure, a vehicle sliding
//! left to right, an animal that comes and goes every 30 frames and a faint
//! bird below the detection threshold. `scene_objects` returns the same
//! objects as ground truth so the stub engine can "detect" them.

use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use imageproc::drawing::draw_filled_rect_mut;
use imageproc::rect::Rect;

use super::VideoSource;
use crate::detect::BBox;
use crate::frame::Frame;

const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const MIN_SIDE: u32 = 64;
const MAX_SIDE: u32 = 4096;

/// Parameters of a `stub://` source.
#[derive(Clone, Debug, PartialEq)]
pub struct SyntheticConfig {
    pub name: String,
    /// Total frames before end of stream; `None` streams forever.
    pub frames: Option<u64>,
    /// Frames per second; 0 produces frames as fast as they are read.
    pub fps: u32,
    pub width: u32,
    pub height: u32,
}

impl Default for SyntheticConfig {
    fn default() -> Self {
        Self {
            name: "synthetic".to_string(),
            frames: None,
            fps: 0,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl SyntheticConfig {
    /// Parse the part after `stub://`, e.g. `demo?frames=30&fps=10`.
    pub fn parse(rest: &str) -> Result<Self> {
        let (name, query) = match rest.split_once('?') {
            Some((name, query)) => (name, Some(query)),
            None => (rest, None),
        };
        let mut cfg = SyntheticConfig {
            name: if name.is_empty() {
                "synthetic".to_string()
            } else {
                name.to_string()
            },
            ..SyntheticConfig::default()
        };
        for pair in query.unwrap_or("").split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("stub source parameter '{}' has no value", pair))?;
            let parse_u32 = |v: &str| {
                v.parse::<u32>()
                    .map_err(|_| anyhow!("stub source parameter '{}' must be an integer", key))
            };
            match key {
                "frames" => {
                    cfg.frames = Some(value.parse().map_err(|_| {
                        anyhow!("stub source parameter 'frames' must be an integer")
                    })?)
                }
                "fps" => cfg.fps = parse_u32(value)?,
                "width" => cfg.width = parse_u32(value)?,
                "height" => cfg.height = parse_u32(value)?,
                other => return Err(anyhow!("unknown stub source parameter '{}'", other)),
            }
        }
        let sides = MIN_SIDE..=MAX_SIDE;
        if !sides.contains(&cfg.width) || !sides.contains(&cfg.height) {
            return Err(anyhow!(
                "stub source size {}x{} outside {}..={} per side",
                cfg.width,
                cfg.height,
                MIN_SIDE,
                MAX_SIDE
            ));
        }
        Ok(cfg)
    }
}

/// Ground truth for one object in a synthetic frame.
#[derive(Clone, Debug, PartialEq)]
pub struct SceneObject {
    pub track_id: i64,
    pub bbox: BBox,
    pub label: &'static str,
    pub confidence: f32,
    pub color: [u8; 3],
}

/// Objects visible in frame `index` of a `width` x `height` synthetic scene.
pub fn scene_objects(index: u64, width: u32, height: u32) -> Vec<SceneObject> {
    let w = width as f32;
    let h = height as f32;
    let mut objects = vec![SceneObject {
        track_id: 1,
        bbox: BBox::new(w * 0.1, h * 0.15, w * 0.35, h * 0.85),
        label: "person",
        confidence: 0.92,
        color: [200, 160, 120],
    }];

    let travel = (w * 0.35) as u64;
    let offset = if travel == 0 { 0.0 } else { ((index * 4) % travel) as f32 };
    let car_x1 = w * 0.4 + offset;
    objects.push(SceneObject {
        track_id: 2,
        bbox: BBox::new(car_x1, h * 0.55, car_x1 + w * 0.2, h * 0.75),
        label: "car",
        confidence: 0.81,
        color: [60, 90, 200],
    });

    if (index / 30) % 2 == 0 {
        objects.push(SceneObject {
            track_id: 3,
            bbox: BBox::new(w * 0.7, h * 0.1, w * 0.9, h * 0.35),
            label: "dog",
            confidence: 0.67,
            color: [150, 110, 60],
        });
    }

    objects.push(SceneObject {
        track_id: 4,
        bbox: BBox::new(w * 0.45, h * 0.05, w * 0.5, h * 0.1),
        label: "bird",
        confidence: 0.31,
        color: [230, 230, 230],
    });
    objects
}

/// Synthetic frame source.
pub struct SyntheticSource {
    config: SyntheticConfig,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    released: bool,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        log::info!("SyntheticSource: opened stub://{}", config.name);
        Self {
            config,
            frame_count: 0,
            last_frame_at: None,
            released: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.frame_count
    }

    fn pace(&mut self) {
        if self.config.fps == 0 {
            return;
        }
        let interval = Duration::from_millis(1000 / self.config.fps.max(1) as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                thread::sleep(interval - elapsed);
            }
        }
        self.last_frame_at = Some(Instant::now());
    }

    fn render(&self, index: u64) -> RgbImage {
        let (width, height) = (self.config.width, self.config.height);
        let mut image = RgbImage::from_fn(width, height, |x, y| {
            let shade = ((u64::from(x) + u64::from(y) + index) % 64) as u8;
            Rgb([30 + shade / 2, 40 + shade / 2, 50 + shade])
        });
        for obj in scene_objects(index, width, height) {
            let x = obj.bbox.x1.round() as i32;
            let y = obj.bbox.y1.round() as i32;
            let w = obj.bbox.width().round().max(1.0) as u32;
            let h = obj.bbox.height().round().max(1.0) as u32;
            draw_filled_rect_mut(&mut image, Rect::at(x, y).of_size(w, h), Rgb(obj.color));
        }
        image
    }
}

impl VideoSource for SyntheticSource {
    fn describe(&self) -> String {
        format!("stub://{}", self.config.name)
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        if let Some(total) = self.config.frames {
            if self.frame_count >= total {
                return Ok(None);
            }
        }
        self.pace();
        let index = self.frame_count;
        self.frame_count += 1;
        Ok(Some(Frame::from_image(self.render(index), index)))
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            log::debug!(
                "SyntheticSource: released stub://{} after {} frames",
                self.config.name,
                self.frame_count
            );
        }
    }
}
