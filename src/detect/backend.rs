use anyhow::Result;

use crate::detect::result::RawDetection;
use crate::frame::Frame;

/// External inference engine.
///
/// Engines are called once per frame by the detection adapter. They own any
/// model state they need; the only cross-call state the pipeline relies on is
/// track persistence, advertised through `persists_tracks`.
pub trait InferenceEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// Returns true when `track_id` values stay stable across calls.
    fn persists_tracks(&self) -> bool {
        false
    }

    /// Run inference on one frame.
    ///
    /// An empty frame result is `Ok(vec![])`, never an error.
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<E: InferenceEngine + ?Sized> InferenceEngine for Box<E> {
    fn name(&self) -> &'static str {
        (**self).name()
    }

    fn persists_tracks(&self) -> bool {
        (**self).persists_tracks()
    }

    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>> {
        (**self).infer(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        (**self).warm_up()
    }
}
