use serde::{Deserialize, Serialize};

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left, `(x2, y2)` bottom-right.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Build from centre/size form as emitted by YOLO-style heads.
    pub fn from_center(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    pub fn width(&self) -> f32 {
        (self.x2 - self.x1).max(0.0)
    }

    pub fn height(&self) -> f32 {
        (self.y2 - self.y1).max(0.0)
    }

    pub fn area(&self) -> f32 {
        self.width() * self.height()
    }

    /// Finite coordinates with `x1 < x2` and `y1 < y2`.
    pub fn is_valid(&self) -> bool {
        [self.x1, self.y1, self.x2, self.y2]
            .iter()
            .all(|v| v.is_finite())
            && self.x1 < self.x2
            && self.y1 < self.y2
    }

    pub fn iou(&self, other: &BBox) -> f32 {
        let ix1 = self.x1.max(other.x1);
        let iy1 = self.y1.max(other.y1);
        let ix2 = self.x2.min(other.x2);
        let iy2 = self.y2.min(other.y2);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - inter;
        if union <= 0.0 {
            0.0
        } else {
            inter / union
        }
    }
}

/// A click position in the frame's pixel coordinate space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// Engine output before normalization.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDetection {
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
    /// Persistent identity assigned by a tracking engine.
    pub track_id: Option<i64>,
}

impl RawDetection {
    pub fn new(bbox: BBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            bbox,
            label: label.into(),
            confidence,
            track_id: None,
        }
    }

    pub fn with_track_id(mut self, track_id: i64) -> Self {
        self.track_id = Some(track_id);
        self
    }
}

/// Canonical detection as stored per stream and used for hit testing.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Detection {
    pub id: i64,
    pub bbox: BBox,
    pub label: String,
    pub confidence: f32,
}

impl Detection {
    pub fn new(id: i64, bbox: BBox, label: impl Into<String>, confidence: f32) -> Self {
        Self {
            id,
            bbox,
            label: label.into(),
            confidence,
        }
    }
}
