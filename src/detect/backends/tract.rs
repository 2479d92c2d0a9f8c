#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::backend::InferenceEngine;
use crate::detect::result::{BBox, RawDetection};
use crate::frame::Frame;

const NMS_IOU_THRESHOLD: f32 = 0.45;

const COCO_LABELS: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Tract-based engine for YOLOv8-style ONNX detectors.
///
/// Expects a single `[1, 3, H, W]` float input and a `[1, 4 + classes, N]`
/// output of centre/size boxes followed by per-class scores. Frames are
/// resized to the model input and boxes scaled back to frame pixels.
pub struct TractEngine {
    model: SimplePlan<TypedFact, Box<dyn TypedOp>>,
    input_width: u32,
    input_height: u32,
    score_threshold: f32,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(model_path: P, input_width: u32, input_height: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(
                    f32::datum_type(),
                    tvec!(1, 3, input_height as usize, input_width as usize),
                ),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            score_threshold: 0.25,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(
            frame.image(),
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        let width = self.input_width as usize;
        let input = tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, width),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        );
        input.into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame: &Frame) -> Result<Vec<RawDetection>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape();
        if shape.len() != 3 || shape[1] <= 4 {
            return Err(anyhow!("unexpected model output shape {:?}", shape));
        }
        let classes = shape[1] - 4;
        let candidates = shape[2];
        let sx = frame.width() as f32 / self.input_width as f32;
        let sy = frame.height() as f32 / self.input_height as f32;

        let mut found = Vec::new();
        for i in 0..candidates {
            let (class, score) = (0..classes)
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if !score.is_finite() || score < self.score_threshold {
                continue;
            }
            let bbox = BBox::from_center(
                view[[0, 0, i]] * sx,
                view[[0, 1, i]] * sy,
                view[[0, 2, i]] * sx,
                view[[0, 3, i]] * sy,
            );
            let label = COCO_LABELS
                .get(class)
                .map(|l| l.to_string())
                .unwrap_or_else(|| format!("class_{}", class));
            found.push(RawDetection::new(bbox, label, score.min(1.0)));
        }
        Ok(non_max_suppression(found, NMS_IOU_THRESHOLD))
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame)
    }
}

/// Class-aware greedy NMS, highest score first.
fn non_max_suppression(mut boxes: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    boxes.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<RawDetection> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        let suppressed = kept.iter().any(|k| {
            k.label == candidate.label && k.bbox.iou(&candidate.bbox) > iou_threshold
        });
        if !suppressed {
            kept.push(candidate);
        }
    }
    kept
}
