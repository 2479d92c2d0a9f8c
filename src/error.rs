use thiserror::Error;

/// Classified failures of a stream or of a selection request.
///
/// `InvalidSelectionRequest` is answered as a client error and `UnknownStream`
/// means the stream already closed (or never started). How the others end a
/// stream is decided by `CloseReason::for_error`.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("video source '{spec}' could not be opened: {reason}")]
    SourceOpen { spec: String, reason: String },

    #[error("frame read failed: {0}")]
    FrameRead(String),

    #[error("frame encode failed: {0}")]
    Encode(String),

    #[error("invalid selection request: {0}")]
    InvalidSelectionRequest(String),

    #[error("inference engine fault: {0}")]
    EngineFault(String),

    #[error("no active stream for key '{0}'")]
    UnknownStream(String),
}

impl StreamError {
    /// Stable identifier used in logs and JSON error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            StreamError::SourceOpen { .. } => "source_open_failure",
            StreamError::FrameRead(_) => "frame_read_failure",
            StreamError::Encode(_) => "encode_failure",
            StreamError::InvalidSelectionRequest(_) => "invalid_selection_request",
            StreamError::EngineFault(_) => "engine_fault",
            StreamError::UnknownStream(_) => "unknown_stream",
        }
    }
}
