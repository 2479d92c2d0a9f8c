//! IoU track-id assignment.
//!
//! Gives a non-tracking engine persistent ids: each frame's boxes are matched
//! greedily (highest IoU first, same label only) against the boxes of live
//! tracks. Unmatched boxes open new tracks; tracks unmatched for more than
//! `max_misses` consecutive frames are retired. Ids are never reused.
//! `TrackedEngine` drops inadmissible boxes (low confidence, degenerate)
//! before matching, so they never hold or steal a track.

use anyhow::Result;

use crate::detect::adapter::is_admissible;
use crate::detect::backend::InferenceEngine;
use crate::detect::result::{BBox, RawDetection};
use crate::frame::Frame;

const DEFAULT_IOU_THRESHOLD: f32 = 0.3;
const DEFAULT_MAX_MISSES: u32 = 30;

#[derive(Clone, Debug)]
struct Track {
    id: i64,
    bbox: BBox,
    label: String,
    misses: u32,
}

#[derive(Debug)]
pub struct IouTracker {
    tracks: Vec<Track>,
    next_id: i64,
    iou_threshold: f32,
    max_misses: u32,
}

impl IouTracker {
    pub fn new() -> Self {
        Self {
            tracks: Vec::new(),
            next_id: 1,
            iou_threshold: DEFAULT_IOU_THRESHOLD,
            max_misses: DEFAULT_MAX_MISSES,
        }
    }

    pub fn with_max_misses(mut self, max_misses: u32) -> Self {
        self.max_misses = max_misses;
        self
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    /// Assign a `track_id` to every detection in place.
    pub fn update(&mut self, detections: &mut [RawDetection]) {
        let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in detections.iter().enumerate() {
                if det.label != track.label {
                    continue;
                }
                let iou = track.bbox.iou(&det.bbox);
                if iou >= self.iou_threshold {
                    pairs.push((iou, ti, di));
                }
            }
        }
        pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

        let mut track_matched = vec![false; self.tracks.len()];
        let mut det_matched = vec![false; detections.len()];
        for (_, ti, di) in pairs {
            if track_matched[ti] || det_matched[di] {
                continue;
            }
            track_matched[ti] = true;
            det_matched[di] = true;
            let track = &mut self.tracks[ti];
            track.bbox = detections[di].bbox;
            track.misses = 0;
            detections[di].track_id = Some(track.id);
        }

        for (track, matched) in self.tracks.iter_mut().zip(&track_matched) {
            if !matched {
                track.misses += 1;
            }
        }
        let max_misses = self.max_misses;
        self.tracks.retain(|t| t.misses <= max_misses);

        for (det, matched) in detections.iter_mut().zip(det_matched) {
            if matched {
                continue;
            }
            let id = self.next_id;
            self.next_id += 1;
            det.track_id = Some(id);
            self.tracks.push(Track {
                id,
                bbox: det.bbox,
                label: det.label.clone(),
                misses: 0,
            });
        }
    }
}

impl Default for IouTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps an engine so its output carries persistent track ids.
pub struct TrackedEngine<E> {
    inner: E,
    tracker: IouTracker,
}

impl<E: InferenceEngine> TrackedEngine<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            tracker: IouTracker::new(),
        }
    }
}

impl<E: InferenceEngine> InferenceEngine for TrackedEngine<E> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn persists_tracks(&self) -> bool {
        true
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let mut detections = self.inner.infer(frame)?;
        detections.retain(is_admissible);
        self.tracker.update(&mut detections);
        Ok(detections)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.inner.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::StubEngine;

    fn det(x1: f32, label: &str) -> RawDetection {
        RawDetection::new(BBox::new(x1, 0.0, x1 + 20.0, 20.0), label, 0.9)
    }

    #[test]
    fn keeps_ids_for_overlapping_boxes() {
        let mut tracker = IouTracker::new();
        let mut f1 = vec![det(0.0, "person"), det(100.0, "car")];
        tracker.update(&mut f1);
        let mut f2 = vec![det(102.0, "car"), det(2.0, "person")];
        tracker.update(&mut f2);

        assert_eq!(f1[0].track_id, f2[1].track_id);
        assert_eq!(f1[1].track_id, f2[0].track_id);
        assert_ne!(f1[0].track_id, f1[1].track_id);
    }

    #[test]
    fn tracked_engine_ignores_low_confidence_boxes() {
        let faint = RawDetection::new(BBox::new(0.0, 0.0, 20.0, 20.0), "person", 0.3);
        let engine = StubEngine::scripted(vec![
            vec![det(0.0, "person")],
            vec![faint, det(8.0, "person")],
        ]);
        let mut tracked = TrackedEngine::new(engine);
        let frame = Frame::new(vec![0u8; 4 * 4 * 3], 4, 4, 0).unwrap();

        let first = tracked.infer(&frame).unwrap();
        let second = tracked.infer(&frame).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].bbox.x1, 8.0);
        assert_eq!(second[0].track_id, first[0].track_id);
        assert_eq!(tracked.tracker.active_tracks(), 1);
    }

    #[test]
    fn label_change_opens_new_track() {
        let mut tracker = IouTracker::new();
        let mut f1 = vec![det(0.0, "person")];
        tracker.update(&mut f1);
        let mut f2 = vec![det(0.0, "dog")];
        tracker.update(&mut f2);
        assert_ne!(f1[0].track_id, f2[0].track_id);
    }

    #[test]
    fn retires_tracks_after_max_misses_and_never_reuses_ids() {
        let mut tracker = IouTracker::new().with_max_misses(1);
        let mut f1 = vec![det(0.0, "person")];
        tracker.update(&mut f1);
        tracker.update(&mut []);
        assert_eq!(tracker.active_tracks(), 1);
        tracker.update(&mut []);
        assert_eq!(tracker.active_tracks(), 0);

        let mut f4 = vec![det(0.0, "person")];
        tracker.update(&mut f4);
        assert_ne!(f1[0].track_id, f4[0].track_id);
    }
}
