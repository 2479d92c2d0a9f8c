//! Per-stream frame loop.
//!
//! `FramePipeline` is a pull-driven state machine:
//!
//! ```text
//! Opening --source opened--> Streaming --EOF / read error / engine fault / cancel--> Closed
//!    \------------------------- source failed to open -------------------------------/
//! ```
//!
//! Each `next()` call reads at most the frames needed to produce one chunk and
//! returns it; nothing is read ahead of the consumer. The stream's state entry
//! is leased when the first chunk is requested. Both the lease and the video
//! source are owned by the `Streaming` phase, so leaving that phase for any
//! reason (including dropping the pipeline mid-stream or unwinding from a
//! panic) releases the source and closes the store entry.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::annotate::{annotate, Overlay};
use crate::detect::DetectionAdapter;
use crate::encode::{multipart_chunk, FrameEncoder};
use crate::error::StreamError;
use crate::ingest::{open_source, SourceSpec, VideoSource};
use crate::store::{StreamLease, StreamStateStore};

/// Deferred source acquisition, run when the first chunk is requested.
pub type SourceOpener = Box<dyn FnOnce() -> Result<Box<dyn VideoSource>> + Send>;

/// Shared flag that asks a pipeline to stop at its next frame boundary.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observable phase of a pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelinePhase {
    Opening,
    Streaming,
    Closed,
}

/// Why a pipeline reached `Closed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    EndOfStream,
    SourceOpenFailure,
    ReadFailure,
    EngineFault,
    Cancelled,
}

impl CloseReason {
    /// How a stream error ends the pipeline. `None` means the error costs
    /// only the current frame and streaming continues.
    pub fn for_error(err: &StreamError) -> Option<CloseReason> {
        match err {
            StreamError::SourceOpen { .. } => Some(CloseReason::SourceOpenFailure),
            StreamError::FrameRead(_) => Some(CloseReason::ReadFailure),
            StreamError::EngineFault(_) => Some(CloseReason::EngineFault),
            StreamError::UnknownStream(_) => Some(CloseReason::Cancelled),
            StreamError::Encode(_) | StreamError::InvalidSelectionRequest(_) => None,
        }
    }

    /// Abnormal endings that the boundary should report.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            CloseReason::SourceOpenFailure | CloseReason::ReadFailure | CloseReason::EngineFault
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            CloseReason::EndOfStream => "end_of_stream",
            CloseReason::SourceOpenFailure => "source_open_failure",
            CloseReason::ReadFailure => "read_failure",
            CloseReason::EngineFault => "engine_fault",
            CloseReason::Cancelled => "cancelled",
        };
        f.write_str(text)
    }
}

/// Counters for one pipeline run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub frames_read: u64,
    pub chunks_emitted: u64,
    pub dropped_frames: u64,
}

/// Releases the source when the streaming phase ends.
struct SourceGuard(Box<dyn VideoSource>);

impl Drop for SourceGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// Resources held while streaming. Field order is drop order: the source is
/// released before the state entry is closed.
struct Active {
    source: SourceGuard,
    _lease: StreamLease,
}

enum Phase {
    Opening(SourceOpener),
    Streaming(Active),
    Closed,
}

enum Step {
    Emit(Vec<u8>),
    Close(CloseReason),
}

pub struct FramePipeline {
    stream_key: String,
    store: Arc<StreamStateStore>,
    adapter: DetectionAdapter,
    encoder: Box<dyn FrameEncoder>,
    cancel: CancelToken,
    phase: Phase,
    close_reason: Option<CloseReason>,
    stats: PipelineStats,
}

impl FramePipeline {
    pub fn new(
        stream_key: impl Into<String>,
        opener: SourceOpener,
        adapter: DetectionAdapter,
        encoder: Box<dyn FrameEncoder>,
        store: Arc<StreamStateStore>,
    ) -> Self {
        Self {
            stream_key: stream_key.into(),
            store,
            adapter,
            encoder,
            cancel: CancelToken::new(),
            phase: Phase::Opening(opener),
            close_reason: None,
            stats: PipelineStats::default(),
        }
    }

    /// Pipeline over a `SourceSpec`, keyed by the spec's description.
    pub fn for_source(
        spec: SourceSpec,
        adapter: DetectionAdapter,
        encoder: Box<dyn FrameEncoder>,
        store: Arc<StreamStateStore>,
    ) -> Self {
        let key = spec.to_string();
        Self::new(key, Box::new(move || open_source(&spec)), adapter, encoder, store)
    }

    /// Stop on `token` instead of the pipeline's own token.
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn stream_key(&self) -> &str {
        &self.stream_key
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> PipelinePhase {
        match self.phase {
            Phase::Opening(_) => PipelinePhase::Opening,
            Phase::Streaming(_) => PipelinePhase::Streaming,
            Phase::Closed => PipelinePhase::Closed,
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Force the pipeline into `Closed`, running the same cleanup as any
    /// other exit.
    pub fn close(&mut self, reason: CloseReason) {
        if !matches!(self.phase, Phase::Closed) {
            self.phase = Phase::Closed;
            self.finish(reason);
        }
    }

    fn finish(&mut self, reason: CloseReason) {
        if self.close_reason.is_none() {
            self.close_reason = Some(reason);
        }
        if reason.is_fault() {
            log::warn!(
                "stream {} closed: {} ({} frames, {} chunks, {} dropped)",
                self.stream_key,
                reason,
                self.stats.frames_read,
                self.stats.chunks_emitted,
                self.stats.dropped_frames
            );
        } else {
            log::info!(
                "stream {} closed: {} ({} frames, {} chunks, {} dropped)",
                self.stream_key,
                reason,
                self.stats.frames_read,
                self.stats.chunks_emitted,
                self.stats.dropped_frames
            );
        }
    }

    fn open(&mut self, opener: SourceOpener) -> Result<Active, StreamError> {
        let lease = self.store.lease(&self.stream_key);
        match opener() {
            Ok(source) => {
                log::info!(
                    "stream {} opened {} (engine: {}, ids: {})",
                    self.stream_key,
                    source.describe(),
                    self.adapter.engine_name(),
                    self.adapter.mode()
                );
                Ok(Active {
                    source: SourceGuard(source),
                    _lease: lease,
                })
            }
            Err(err) => Err(StreamError::SourceOpen {
                spec: self.stream_key.clone(),
                reason: format!("{:#}", err),
            }),
        }
    }

    fn step(&mut self, active: &mut Active) -> Result<Step, StreamError> {
        if self.cancel.is_cancelled() {
            return Ok(Step::Close(CloseReason::Cancelled));
        }

        let frame = match active.source.0.read() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(Step::Close(CloseReason::EndOfStream)),
            Err(err) => return Err(StreamError::FrameRead(format!("{:#}", err))),
        };
        self.stats.frames_read += 1;

        let detections = self.adapter.detect(&frame)?;
        let state = self.store.update_and_snapshot(&self.stream_key, detections)?;
        let annotated = annotate(&frame, &Overlay::from_state(&state));
        let bytes = self.encoder.encode(&annotated)?;
        Ok(Step::Emit(multipart_chunk(&bytes)))
    }
}

impl Iterator for FramePipeline {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Closed) {
                Phase::Opening(opener) => match self.open(opener) {
                    Ok(active) => self.phase = Phase::Streaming(active),
                    Err(err) => {
                        log::warn!("stream {}: {} [{}]", self.stream_key, err, err.kind());
                        self.finish(CloseReason::SourceOpenFailure);
                        return None;
                    }
                },
                Phase::Streaming(mut active) => match self.step(&mut active) {
                    Ok(Step::Emit(chunk)) => {
                        self.phase = Phase::Streaming(active);
                        self.stats.chunks_emitted += 1;
                        return Some(chunk);
                    }
                    Ok(Step::Close(reason)) => {
                        drop(active);
                        self.finish(reason);
                        return None;
                    }
                    Err(err) => match CloseReason::for_error(&err) {
                        None => {
                            log::warn!(
                                "stream {}: dropping frame {}: {} [{}]",
                                self.stream_key,
                                self.stats.frames_read,
                                err,
                                err.kind()
                            );
                            self.phase = Phase::Streaming(active);
                            self.stats.dropped_frames += 1;
                        }
                        Some(reason) => {
                            if reason.is_fault() {
                                log::error!("stream {}: {} [{}]", self.stream_key, err, err.kind());
                            } else {
                                log::info!("stream {}: {}; ending stream", self.stream_key, err);
                            }
                            drop(active);
                            self.finish(reason);
                            return None;
                        }
                    },
                },
                Phase::Closed => return None,
            }
        }
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if matches!(self.phase, Phase::Streaming(_)) {
            self.close(CloseReason::Cancelled);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{IdMode, StubEngine};
    use crate::encode::JpegFrameEncoder;
    use crate::select::SelectionPolicy;

    fn stub_pipeline(source: &str, store: &Arc<StreamStateStore>) -> FramePipeline {
        FramePipeline::for_source(
            SourceSpec::parse(source).unwrap(),
            DetectionAdapter::new(Box::new(StubEngine::scene()), IdMode::Track),
            Box::new(JpegFrameEncoder::default()),
            Arc::clone(store),
        )
    }

    #[test]
    fn streams_until_end_and_closes_entry() {
        let store = Arc::new(StreamStateStore::new(SelectionPolicy::RejectWhileLocked));
        let mut pipeline = stub_pipeline("stub://unit?frames=3&width=96&height=96", &store);
        assert_eq!(pipeline.phase(), PipelinePhase::Opening);
        assert!(!store.contains("stub://unit"));

        assert!(pipeline.next().is_some());
        assert_eq!(pipeline.phase(), PipelinePhase::Streaming);
        assert!(store.contains("stub://unit"));

        assert_eq!(pipeline.by_ref().count(), 2);
        assert_eq!(pipeline.phase(), PipelinePhase::Closed);
        assert_eq!(pipeline.close_reason(), Some(CloseReason::EndOfStream));
        assert!(!store.contains("stub://unit"));
        assert!(pipeline.next().is_none());
    }

    #[test]
    fn drop_mid_stream_closes_entry() {
        let store = Arc::new(StreamStateStore::default());
        let mut pipeline = stub_pipeline("stub://drop?width=96&height=96", &store);
        pipeline.next();
        assert!(store.contains("stub://drop"));
        drop(pipeline);
        assert!(store.is_empty());
    }

    #[test]
    fn cancel_token_stops_at_next_frame() {
        let store = Arc::new(StreamStateStore::default());
        let mut pipeline = stub_pipeline("stub://cancel?width=96&height=96", &store);
        let token = pipeline.cancel_token();
        pipeline.next();
        token.cancel();
        assert!(pipeline.next().is_none());
        assert_eq!(pipeline.close_reason(), Some(CloseReason::Cancelled));
        assert!(store.is_empty());
    }

    #[test]
    fn stream_errors_map_to_close_reasons() {
        let open = StreamError::SourceOpen {
            spec: "missing.mp4".into(),
            reason: "not found".into(),
        };
        assert_eq!(CloseReason::for_error(&open), Some(CloseReason::SourceOpenFailure));
        assert_eq!(
            CloseReason::for_error(&StreamError::FrameRead("eof".into())),
            Some(CloseReason::ReadFailure)
        );
        assert_eq!(
            CloseReason::for_error(&StreamError::EngineFault("boom".into())),
            Some(CloseReason::EngineFault)
        );
        assert_eq!(
            CloseReason::for_error(&StreamError::UnknownStream("k".into())),
            Some(CloseReason::Cancelled)
        );
        assert_eq!(CloseReason::for_error(&StreamError::Encode("bad".into())), None);
    }

    #[test]
    fn close_reason_faults() {
        assert!(CloseReason::SourceOpenFailure.is_fault());
        assert!(CloseReason::EngineFault.is_fault());
        assert!(!CloseReason::EndOfStream.is_fault());
        assert!(!CloseReason::Cancelled.is_fault());
        assert_eq!(CloseReason::ReadFailure.to_string(), "read_failure");
    }
}
