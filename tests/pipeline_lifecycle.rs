use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use lockstream::detect::{BBox, RawDetection, StubEngine};
use lockstream::encode::{FrameEncoder, JpegFrameEncoder};
use lockstream::{
    CloseReason, DetectionAdapter, Frame, FramePipeline, IdMode, PipelinePhase, Point,
    SelectionOutcome, SelectionPolicy, StreamError, StreamStateStore, VideoSource,
};

const RED: Rgb<u8> = Rgb([255, 0, 0]);
const BLACK: Rgb<u8> = Rgb([0, 0, 0]);

/// Black frames, optionally failing on one read.
struct TestSource {
    remaining: u64,
    index: u64,
    fail_on_read: Option<u64>,
    released: Arc<AtomicBool>,
}

impl TestSource {
    fn new(frames: u64, released: &Arc<AtomicBool>) -> Self {
        Self {
            remaining: frames,
            index: 0,
            fail_on_read: None,
            released: Arc::clone(released),
        }
    }
}

impl VideoSource for TestSource {
    fn describe(&self) -> String {
        "test source".to_string()
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        if self.fail_on_read == Some(self.index) {
            return Err(anyhow!("decoder error"));
        }
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        let frame = Frame::from_image(RgbImage::from_pixel(160, 100, BLACK), self.index);
        self.index += 1;
        Ok(Some(frame))
    }

    fn release(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Keeps every annotated image; fails on the listed calls.
#[derive(Clone, Default)]
struct RecordingEncoder {
    images: Arc<Mutex<Vec<RgbImage>>>,
    fail_calls: Vec<usize>,
    calls: usize,
}

impl FrameEncoder for RecordingEncoder {
    fn encode(&mut self, image: &RgbImage) -> Result<Vec<u8>, StreamError> {
        let call = self.calls;
        self.calls += 1;
        if self.fail_calls.contains(&call) {
            return Err(StreamError::Encode("injected".to_string()));
        }
        self.images.lock().unwrap().push(image.clone());
        JpegFrameEncoder::default().encode(image)
    }
}

fn two_boxes() -> Vec<RawDetection> {
    vec![
        RawDetection::new(BBox::new(60.0, 30.0, 100.0, 70.0), "person", 0.8),
        RawDetection::new(BBox::new(10.0, 30.0, 50.0, 70.0), "person", 0.9),
    ]
}

fn pipeline_with(
    source: TestSource,
    engine: StubEngine,
    encoder: RecordingEncoder,
    store: &Arc<StreamStateStore>,
) -> FramePipeline {
    FramePipeline::new(
        "clip.mp4",
        Box::new(move || Ok(Box::new(source) as Box<dyn VideoSource>)),
        DetectionAdapter::new(Box::new(engine), IdMode::Ephemeral),
        Box::new(encoder),
        Arc::clone(store),
    )
}

fn new_store() -> Arc<StreamStateStore> {
    Arc::new(StreamStateStore::new(SelectionPolicy::RejectWhileLocked))
}

#[test]
fn open_failure_yields_no_chunks_and_no_state() {
    let store = new_store();
    let mut pipeline = FramePipeline::new(
        "missing.mp4",
        Box::new(|| Err(anyhow!("no such file"))),
        DetectionAdapter::new(Box::new(StubEngine::empty()), IdMode::Ephemeral),
        Box::new(JpegFrameEncoder::default()),
        Arc::clone(&store),
    );
    assert!(pipeline.next().is_none());
    assert_eq!(pipeline.phase(), PipelinePhase::Closed);
    assert_eq!(pipeline.close_reason(), Some(CloseReason::SourceOpenFailure));
    assert_eq!(pipeline.stats().frames_read, 0);
    assert!(store.is_empty());
}

#[test]
fn lock_changes_what_is_drawn() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let encoder = RecordingEncoder::default();
    let images = Arc::clone(&encoder.images);
    let engine = StubEngine::scripted(vec![two_boxes()]);
    let mut pipeline = pipeline_with(TestSource::new(5, &released), engine, encoder, &store);

    assert!(pipeline.next().is_some());
    assert_eq!(
        store.try_select("clip.mp4", Point::new(30.0, 50.0)).unwrap(),
        SelectionOutcome::Selected { id: 0 }
    );
    assert!(pipeline.next().is_some());

    let images = images.lock().unwrap();
    assert_ne!(*images[0].get_pixel(10, 50), BLACK);
    assert_ne!(*images[0].get_pixel(60, 50), BLACK);
    assert_eq!(*images[1].get_pixel(10, 50), RED);
    assert_eq!(*images[1].get_pixel(60, 50), BLACK);
}

#[test]
fn lost_object_leaves_clean_frames() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let encoder = RecordingEncoder::default();
    let images = Arc::clone(&encoder.images);
    let only_right = vec![RawDetection::new(BBox::new(60.0, 30.0, 100.0, 70.0), "person", 0.8)];
    let engine = StubEngine::scripted(vec![
        two_boxes(),
        two_boxes(),
        only_right.clone(),
        only_right,
    ]);
    let mut pipeline = pipeline_with(TestSource::new(4, &released), engine, encoder, &store);

    pipeline.next();
    // Box (60, 30)-(100, 70) is at index 1 while both are present.
    store.try_select("clip.mp4", Point::new(80.0, 50.0)).unwrap();
    pipeline.next();
    pipeline.next();
    assert_eq!(store.selected_id("clip.mp4"), Some(1));
    assert!(store.get_selected("clip.mp4").is_none());

    let images = images.lock().unwrap();
    assert_eq!(*images[1].get_pixel(60, 50), RED);
    assert!(images[2].pixels().all(|p| *p == BLACK));
}

#[test]
fn end_of_stream_releases_source_and_state() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut pipeline = pipeline_with(
        TestSource::new(3, &released),
        StubEngine::scripted(vec![two_boxes()]),
        RecordingEncoder::default(),
        &store,
    );
    let chunks: Vec<Vec<u8>> = pipeline.by_ref().collect();
    assert_eq!(chunks.len(), 3);
    for chunk in &chunks {
        assert!(chunk.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(chunk.ends_with(b"\r\n"));
    }
    assert_eq!(pipeline.close_reason(), Some(CloseReason::EndOfStream));
    assert!(released.load(Ordering::SeqCst));
    assert!(store.is_empty());
}

#[test]
fn read_failure_closes_stream() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut source = TestSource::new(10, &released);
    source.fail_on_read = Some(2);
    let mut pipeline = pipeline_with(
        source,
        StubEngine::empty(),
        RecordingEncoder::default(),
        &store,
    );
    assert_eq!(pipeline.by_ref().count(), 2);
    assert_eq!(pipeline.close_reason(), Some(CloseReason::ReadFailure));
    assert!(released.load(Ordering::SeqCst));
    assert!(store.is_empty());
}

#[test]
fn engine_fault_closes_stream() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut pipeline = pipeline_with(
        TestSource::new(10, &released),
        StubEngine::scripted(vec![two_boxes()]).failing_on_call(1),
        RecordingEncoder::default(),
        &store,
    );
    assert_eq!(pipeline.by_ref().count(), 1);
    assert_eq!(pipeline.close_reason(), Some(CloseReason::EngineFault));
    assert!(released.load(Ordering::SeqCst));
    assert!(store.is_empty());
}

#[test]
fn encode_failure_drops_only_that_frame() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let encoder = RecordingEncoder {
        fail_calls: vec![1, 2],
        ..RecordingEncoder::default()
    };
    let mut pipeline = pipeline_with(
        TestSource::new(5, &released),
        StubEngine::scripted(vec![two_boxes()]),
        encoder,
        &store,
    );
    assert_eq!(pipeline.by_ref().count(), 3);
    let stats = pipeline.stats();
    assert_eq!(stats.frames_read, 5);
    assert_eq!(stats.chunks_emitted, 3);
    assert_eq!(stats.dropped_frames, 2);
    assert_eq!(pipeline.close_reason(), Some(CloseReason::EndOfStream));
}

#[test]
fn consumer_leaving_mid_stream_cleans_up() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut pipeline = pipeline_with(
        TestSource::new(100, &released),
        StubEngine::scripted(vec![two_boxes()]),
        RecordingEncoder::default(),
        &store,
    );
    pipeline.next();
    pipeline.next();
    assert!(store.contains("clip.mp4"));
    assert!(!released.load(Ordering::SeqCst));

    drop(pipeline);
    assert!(released.load(Ordering::SeqCst));
    assert!(!store.contains("clip.mp4"));
    assert!(matches!(
        store.try_select("clip.mp4", Point::new(30.0, 50.0)),
        Err(StreamError::UnknownStream(_))
    ));
}

#[test]
fn external_close_ends_stream_as_cancelled() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut pipeline = pipeline_with(
        TestSource::new(100, &released),
        StubEngine::scripted(vec![two_boxes()]),
        RecordingEncoder::default(),
        &store,
    );
    pipeline.next();
    store.close("clip.mp4");
    assert!(pipeline.next().is_none());
    assert_eq!(pipeline.close_reason(), Some(CloseReason::Cancelled));
    assert!(released.load(Ordering::SeqCst));
}

#[test]
fn reopening_a_key_starts_fresh() {
    let store = new_store();
    let released = Arc::new(AtomicBool::new(false));
    let mut first = pipeline_with(
        TestSource::new(2, &released),
        StubEngine::scripted(vec![two_boxes()]),
        RecordingEncoder::default(),
        &store,
    );
    first.next();
    store.try_select("clip.mp4", Point::new(30.0, 50.0)).unwrap();
    assert_eq!(first.by_ref().count(), 1);

    let mut second = pipeline_with(
        TestSource::new(2, &released),
        StubEngine::empty(),
        RecordingEncoder::default(),
        &store,
    );
    second.next();
    let state = store.snapshot("clip.mp4").unwrap();
    assert_eq!(state.selected_id, None);
    assert!(state.detections.is_empty());
}
