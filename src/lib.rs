//! lockstream: interactive object-lock video streaming.
//!
//! Frames are pulled from a video source, run through an inference engine,
//! annotated and served as a `multipart/x-mixed-replace` JPEG stream. A viewer
//! clicks an object to lock onto it; from then on only that object is drawn
//! until the selection is reset.
//!
//! # Module Structure
//!
//! - `ingest`: Video sources (synthetic `stub://`, files and devices via FFmpeg)
//! - `detect`: Inference engines, IoU tracking and the detection adapter
//! - `store`: Per-stream detection and selection state
//! - `select`: Click-to-lock resolution
//! - `annotate`: Overlay rendering
//! - `encode`: JPEG and multipart framing
//! - `pipeline`: Per-stream frame loop with guaranteed cleanup
//! - `api`: HTTP boundary
//! - `config`: File and environment configuration

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod encode;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod pipeline;
pub mod select;
pub mod store;

pub use api::{ApiConfig, ApiHandle, ApiServer};
pub use config::LockstreamConfig;
pub use detect::{
    BBox, Detection, DetectionAdapter, EngineRegistry, IdMode, InferenceEngine, Point,
    RawDetection,
};
pub use error::StreamError;
pub use frame::Frame;
pub use ingest::{open_source, SourceSpec, VideoSource};
pub use pipeline::{CancelToken, CloseReason, FramePipeline, PipelinePhase, PipelineStats};
pub use select::{SelectionOutcome, SelectionPolicy};
pub use store::{StreamLease, StreamState, StreamStateStore};

/// Engine registry with every engine compiled into this build.
///
/// `stub` replays the synthetic scene and is always available; `tract` loads
/// the ONNX model at `model_path` (feature `backend-tract`).
pub fn default_registry(model_path: Option<std::path::PathBuf>) -> EngineRegistry {
    let mut registry = EngineRegistry::new();
    registry.register("stub", || Ok(Box::new(detect::StubEngine::scene())));
    #[cfg(feature = "backend-tract")]
    {
        if let Some(path) = model_path {
            registry.register("tract", move || {
                Ok(Box::new(detect::backends::TractEngine::new(&path, 640, 640)?))
            });
        }
    }
    #[cfg(not(feature = "backend-tract"))]
    {
        if let Some(path) = model_path {
            log::warn!(
                "model {} ignored: built without the backend-tract feature",
                path.display()
            );
        }
    }
    registry
}
