use anyhow::{anyhow, Result};

use crate::detect::backend::InferenceEngine;
use crate::detect::result::RawDetection;
use crate::frame::Frame;
use crate::ingest::synthetic::scene_objects;

/// Stub engine for tests and demos.
///
/// `scripted` replays a fixed list of per-call outputs (cycling when the list
/// runs out). `scene` reports the objects that the `stub://` synthetic source
/// draws into each frame, with persistent track ids.
pub struct StubEngine {
    mode: StubMode,
    calls: u64,
    fail_on_call: Option<u64>,
    persists_tracks: bool,
}

enum StubMode {
    Scripted(Vec<Vec<RawDetection>>),
    Scene,
}

impl StubEngine {
    pub fn empty() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Vec<RawDetection>>) -> Self {
        Self {
            mode: StubMode::Scripted(script),
            calls: 0,
            fail_on_call: None,
            persists_tracks: false,
        }
    }

    pub fn scene() -> Self {
        Self {
            mode: StubMode::Scene,
            calls: 0,
            fail_on_call: None,
            persists_tracks: true,
        }
    }

    /// Declare that scripted `track_id`s are persistent.
    pub fn with_tracking(mut self, persists: bool) -> Self {
        self.persists_tracks = persists;
        self
    }

    /// Return an error on the given 0-based call.
    pub fn failing_on_call(mut self, call: u64) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn calls(&self) -> u64 {
        self.calls
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn persists_tracks(&self) -> bool {
        self.persists_tracks
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_on_call == Some(call) {
            return Err(anyhow!("stub engine failure on call {}", call));
        }

        match &self.mode {
            StubMode::Scripted(script) if script.is_empty() => Ok(Vec::new()),
            StubMode::Scripted(script) => Ok(script[(call as usize) % script.len()].clone()),
            StubMode::Scene => Ok(scene_objects(frame.index(), frame.width(), frame.height())
                .into_iter()
                .map(|obj| {
                    RawDetection::new(obj.bbox, obj.label, obj.confidence)
                        .with_track_id(obj.track_id)
                })
                .collect()),
        }
    }
}
