use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::Deserialize;

use crate::detect::backend::InferenceEngine;
use crate::detect::result::{Detection, RawDetection};
use crate::detect::tracker::TrackedEngine;
use crate::error::StreamError;
use crate::frame::Frame;

/// Detections below this confidence are discarded before anything else sees them.
pub const CONFIDENCE_THRESHOLD: f32 = 0.5;

/// How detection ids are derived for a stream.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdMode {
    /// Ids are the engine's persistent track ids.
    #[default]
    Track,
    /// Ids are 0-based positions within the current frame.
    Ephemeral,
}

impl FromStr for IdMode {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "track" => Ok(IdMode::Track),
            "ephemeral" => Ok(IdMode::Ephemeral),
            other => Err(anyhow!(
                "unknown id mode '{}' (expected 'track' or 'ephemeral')",
                other
            )),
        }
    }
}

impl fmt::Display for IdMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdMode::Track => f.write_str("track"),
            IdMode::Ephemeral => f.write_str("ephemeral"),
        }
    }
}

/// Single translation boundary between an inference engine and the stream state.
pub struct DetectionAdapter {
    engine: Box<dyn InferenceEngine>,
    mode: IdMode,
}

impl DetectionAdapter {
    /// Wrap an engine. In track mode an engine without persistent track ids
    /// is wrapped in an IoU tracker so ids stay stable across frames.
    pub fn new(engine: Box<dyn InferenceEngine>, mode: IdMode) -> Self {
        let engine: Box<dyn InferenceEngine> = if mode == IdMode::Track && !engine.persists_tracks()
        {
            log::info!(
                "engine '{}' does not persist tracks; assigning track ids by IoU",
                engine.name()
            );
            Box::new(TrackedEngine::new(engine))
        } else {
            engine
        };
        Self { engine, mode }
    }

    pub fn mode(&self) -> IdMode {
        self.mode
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    /// Run the engine once on `frame` and return canonical detections.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>, StreamError> {
        let raw = self
            .engine
            .infer(frame)
            .map_err(|e| StreamError::EngineFault(format!("{}: {:#}", self.engine.name(), e)))?;
        Ok(normalize(raw, self.mode))
    }
}

/// Filter, order and assign ids to raw engine output.
///
/// The output order is deterministic for a given input set: ascending track
/// id in track mode, top-to-bottom then left-to-right in ephemeral mode.
pub fn normalize(raw: Vec<RawDetection>, mode: IdMode) -> Vec<Detection> {
    let mut kept: Vec<RawDetection> = raw.into_iter().filter(is_admissible).collect();

    match mode {
        IdMode::Track => {
            kept.retain(|d| d.track_id.is_some());
            kept.sort_by_key(|d| d.track_id);
            kept.into_iter()
                .filter_map(|d| {
                    let id = d.track_id?;
                    Some(Detection::new(id, d.bbox, d.label, d.confidence.min(1.0)))
                })
                .collect()
        }
        IdMode::Ephemeral => {
            kept.sort_by(spatial_order);
            kept.into_iter()
                .enumerate()
                .map(|(idx, d)| Detection::new(idx as i64, d.bbox, d.label, d.confidence.min(1.0)))
                .collect()
        }
    }
}

/// Confident enough and geometrically valid. Anything else is discarded
/// before ids are assigned, including by the IoU tracker.
pub fn is_admissible(detection: &RawDetection) -> bool {
    detection.confidence.is_finite()
        && detection.confidence >= CONFIDENCE_THRESHOLD
        && detection.bbox.is_valid()
}

fn spatial_order(a: &RawDetection, b: &RawDetection) -> Ordering {
    a.bbox
        .y1
        .total_cmp(&b.bbox.y1)
        .then(a.bbox.x1.total_cmp(&b.bbox.x1))
        .then(a.bbox.x2.total_cmp(&b.bbox.x2))
        .then(a.bbox.y2.total_cmp(&b.bbox.y2))
        .then_with(|| a.label.cmp(&b.label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubEngine;
    use crate::detect::result::BBox;

    fn raw(x1: f32, y1: f32, conf: f32) -> RawDetection {
        RawDetection::new(BBox::new(x1, y1, x1 + 10.0, y1 + 10.0), "person", conf)
    }

    fn frame(index: u64) -> Frame {
        Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, index).unwrap()
    }

    #[test]
    fn discards_below_threshold_and_keeps_exact_threshold() {
        let out = normalize(
            vec![raw(0.0, 0.0, 0.49), raw(20.0, 0.0, 0.5), raw(40.0, 0.0, 0.9)],
            IdMode::Ephemeral,
        );
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].confidence, 0.5);
        assert_eq!(out[1].confidence, 0.9);
    }

    #[test]
    fn ephemeral_ids_are_positions_in_deterministic_order() {
        let a = vec![raw(50.0, 10.0, 0.9), raw(10.0, 10.0, 0.8), raw(0.0, 0.0, 0.7)];
        let mut b = a.clone();
        b.reverse();

        let out_a = normalize(a, IdMode::Ephemeral);
        let out_b = normalize(b, IdMode::Ephemeral);
        assert_eq!(out_a, out_b);
        let ids: Vec<i64> = out_a.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(out_a[0].bbox.y1, 0.0);
        assert_eq!(out_a[1].bbox.x1, 10.0);
        assert_eq!(out_a[2].bbox.x1, 50.0);
    }

    #[test]
    fn track_mode_uses_engine_ids_sorted_ascending() {
        let out = normalize(
            vec![
                raw(0.0, 0.0, 0.9).with_track_id(7),
                raw(20.0, 0.0, 0.9).with_track_id(3),
                raw(40.0, 0.0, 0.9),
            ],
            IdMode::Track,
        );
        let ids: Vec<i64> = out.iter().map(|d| d.id).collect();
        assert_eq!(ids, vec![3, 7]);
    }

    #[test]
    fn invalid_boxes_are_dropped() {
        let degenerate = RawDetection::new(BBox::new(5.0, 5.0, 5.0, 9.0), "cup", 0.9);
        assert!(normalize(vec![degenerate], IdMode::Ephemeral).is_empty());
    }

    #[test]
    fn empty_engine_output_is_empty_list() {
        let mut adapter = DetectionAdapter::new(Box::new(StubEngine::empty()), IdMode::Ephemeral);
        assert!(adapter.detect(&frame(0)).unwrap().is_empty());
    }

    #[test]
    fn ephemeral_ids_rederived_each_frame() {
        let engine = StubEngine::scripted(vec![
            vec![raw(0.0, 0.0, 0.9), raw(30.0, 0.0, 0.9)],
            vec![raw(30.0, 0.0, 0.9)],
        ]);
        let mut adapter = DetectionAdapter::new(Box::new(engine), IdMode::Ephemeral);
        let first = adapter.detect(&frame(0)).unwrap();
        let second = adapter.detect(&frame(1)).unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, 0);
        assert_eq!(second[0].bbox.x1, 30.0);
    }

    #[test]
    fn engine_errors_become_engine_faults() {
        let mut adapter = DetectionAdapter::new(
            Box::new(StubEngine::empty().failing_on_call(0)),
            IdMode::Ephemeral,
        );
        let err = adapter.detect(&frame(0)).unwrap_err();
        assert!(matches!(err, StreamError::EngineFault(_)));
    }

    #[test]
    fn track_mode_wraps_non_tracking_engine() {
        let engine = StubEngine::scripted(vec![vec![raw(0.0, 0.0, 0.9)], vec![raw(1.0, 0.0, 0.9)]]);
        let mut adapter = DetectionAdapter::new(Box::new(engine), IdMode::Track);
        let first = adapter.detect(&frame(0)).unwrap();
        let second = adapter.detect(&frame(1)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn low_confidence_box_cannot_take_over_a_track_id() {
        let person = |x1: f32, conf: f32| {
            RawDetection::new(BBox::new(x1, 0.0, x1 + 20.0, 20.0), "person", conf)
        };
        let engine = StubEngine::scripted(vec![
            vec![person(0.0, 0.9)],
            vec![person(0.0, 0.3), person(8.0, 0.9)],
        ]);
        let mut adapter = DetectionAdapter::new(Box::new(engine), IdMode::Track);
        let first = adapter.detect(&frame(0)).unwrap();
        let second = adapter.detect(&frame(1)).unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].bbox.x1, 8.0);
        assert_eq!(second[0].id, first[0].id);
    }

    #[test]
    fn parses_id_mode() {
        assert_eq!("Track".parse::<IdMode>().unwrap(), IdMode::Track);
        assert_eq!("ephemeral".parse::<IdMode>().unwrap(), IdMode::Ephemeral);
        assert!("sticky".parse::<IdMode>().is_err());
    }
}
