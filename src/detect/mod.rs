mod adapter;
mod backend;
pub mod backends;
mod registry;
mod result;
pub mod tracker;

pub use adapter::{normalize, DetectionAdapter, IdMode, CONFIDENCE_THRESHOLD};
pub use backend::InferenceEngine;
pub use backends::StubEngine;
pub use registry::{EngineFactory, EngineRegistry};
pub use result::{BBox, Detection, Point, RawDetection};
pub use tracker::{IouTracker, TrackedEngine};
