//! Click-to-lock selection.
//!
//! A click is resolved against the current frame's detections with a strict
//! point-in-box test. The first detection in list order that contains the
//! point wins; list order is fixed by the detection adapter.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::detect::{BBox, Detection, Point};
use crate::store::StreamState;

/// What happens when a click arrives while an object is already locked.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Reject with `AlreadyLocked` until the selection is reset.
    #[default]
    RejectWhileLocked,
    /// A hit replaces the current lock; a miss keeps it.
    Override,
}

impl FromStr for SelectionPolicy {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "reject_while_locked" | "reject" => Ok(SelectionPolicy::RejectWhileLocked),
            "override" => Ok(SelectionPolicy::Override),
            other => Err(anyhow!(
                "unknown selection policy '{}' (expected 'reject_while_locked' or 'override')",
                other
            )),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::RejectWhileLocked => f.write_str("reject_while_locked"),
            SelectionPolicy::Override => f.write_str("override"),
        }
    }
}

/// Result of a selection request. None of these are errors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SelectionOutcome {
    Selected { id: i64 },
    AlreadyLocked { selected_id: i64 },
    NoHit,
}

/// Boundary-exclusive containment: `x1 < x < x2 && y1 < y < y2`.
pub fn hit(point: Point, bbox: &BBox) -> bool {
    bbox.x1 < point.x && point.x < bbox.x2 && bbox.y1 < point.y && point.y < bbox.y2
}

/// First detection, in list order, whose box contains `point`.
pub fn first_hit(detections: &[Detection], point: Point) -> Option<&Detection> {
    detections.iter().find(|d| hit(point, &d.bbox))
}

/// Apply a click to a stream's state.
pub fn resolve(state: &mut StreamState, point: Point, policy: SelectionPolicy) -> SelectionOutcome {
    if let (Some(selected_id), SelectionPolicy::RejectWhileLocked) = (state.selected_id, policy) {
        return SelectionOutcome::AlreadyLocked { selected_id };
    }
    match first_hit(&state.detections, point) {
        Some(detection) => {
            let id = detection.id;
            state.selected_id = Some(id);
            SelectionOutcome::Selected { id }
        }
        None => SelectionOutcome::NoHit,
    }
}

/// Drop the lock, whatever it was.
pub fn clear(state: &mut StreamState) {
    state.selected_id = None;
}
