//! Per-stream detection and selection state.
//!
//! The store is the only owner of `StreamState`. Each key has its own mutex;
//! the outer map mutex is held just long enough to find or insert an entry,
//! so work on one stream never waits on another stream's lock.
//!
//! Callers never keep a reference into a state: readers get a cloned
//! `snapshot`, writers go through the store's methods.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::detect::{Detection, Point};
use crate::error::StreamError;
use crate::select::{self, SelectionOutcome, SelectionPolicy};

/// Mutable state of one stream.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamState {
    pub stream_key: String,
    /// Detections of the most recent frame only.
    pub detections: Vec<Detection>,
    pub selected_id: Option<i64>,
}

impl StreamState {
    pub fn new(stream_key: impl Into<String>) -> Self {
        Self {
            stream_key: stream_key.into(),
            detections: Vec::new(),
            selected_id: None,
        }
    }

    /// Current-frame detection matching the lock, if any.
    pub fn selected_detection(&self) -> Option<&Detection> {
        let id = self.selected_id?;
        self.detections.iter().find(|d| d.id == id)
    }
}

type Entry = Arc<Mutex<StreamState>>;

/// Process-wide map from stream key to state.
#[derive(Debug, Default)]
pub struct StreamStateStore {
    entries: Mutex<HashMap<String, Entry>>,
    policy: SelectionPolicy,
}

// A panicking holder cannot leave a state half-written: every mutation is a
// single field assignment, so a poisoned lock is still safe to read.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StreamStateStore {
    pub fn new(policy: SelectionPolicy) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn entry(&self, key: &str) -> Option<Entry> {
        lock(&self.entries).get(key).cloned()
    }

    fn existing(&self, key: &str) -> Result<Entry, StreamError> {
        self.entry(key)
            .ok_or_else(|| StreamError::UnknownStream(key.to_string()))
    }

    /// Create an empty state for `key` if none exists.
    pub fn open(&self, key: &str) {
        let mut entries = lock(&self.entries);
        if !entries.contains_key(key) {
            entries.insert(key.to_string(), Arc::new(Mutex::new(StreamState::new(key))));
            log::debug!("stream state opened: {}", key);
        }
    }

    /// Open `key` and return a guard that closes it when dropped.
    pub fn lease(self: &Arc<Self>, key: &str) -> StreamLease {
        self.open(key);
        StreamLease {
            store: Arc::clone(self),
            key: key.to_string(),
        }
    }

    /// Replace the detection list. The lock, if any, is kept.
    pub fn update_detections(&self, key: &str, detections: Vec<Detection>) -> Result<(), StreamError> {
        let entry = self.existing(key)?;
        lock(&entry).detections = detections;
        Ok(())
    }

    /// Replace the detection list and return the resulting state in one
    /// critical section.
    pub fn update_and_snapshot(
        &self,
        key: &str,
        detections: Vec<Detection>,
    ) -> Result<StreamState, StreamError> {
        let entry = self.existing(key)?;
        let mut state = lock(&entry);
        state.detections = detections;
        Ok(state.clone())
    }

    /// The current-frame detection whose id equals the lock.
    pub fn get_selected(&self, key: &str) -> Option<Detection> {
        let entry = self.entry(key)?;
        let state = lock(&entry);
        let selected = state.selected_detection().cloned();
        selected
    }

    pub fn selected_id(&self, key: &str) -> Option<i64> {
        let entry = self.entry(key)?;
        let selected = lock(&entry).selected_id;
        selected
    }

    /// Resolve a click against the current detections under the key's lock.
    pub fn try_select(&self, key: &str, point: Point) -> Result<SelectionOutcome, StreamError> {
        if !point.is_finite() {
            return Err(StreamError::InvalidSelectionRequest(format!(
                "coordinates must be finite, got ({}, {})",
                point.x, point.y
            )));
        }
        let entry = self.existing(key)?;
        let mut state = lock(&entry);
        let outcome = select::resolve(&mut state, point, self.policy);
        log::debug!(
            "selection on {} at ({}, {}): {:?}",
            key,
            point.x,
            point.y,
            outcome
        );
        Ok(outcome)
    }

    /// Clear the lock. Detections are untouched; unknown keys are a no-op.
    pub fn reset(&self, key: &str) {
        if let Some(entry) = self.entry(key) {
            select::clear(&mut lock(&entry));
        }
    }

    /// Remove the entry. Returns false when the key was not present.
    pub fn close(&self, key: &str) -> bool {
        let removed = lock(&self.entries).remove(key).is_some();
        if removed {
            log::debug!("stream state closed: {}", key);
        }
        removed
    }

    /// Cloned, consistent view of one stream.
    pub fn snapshot(&self, key: &str) -> Option<StreamState> {
        let entry = self.entry(key)?;
        let state = lock(&entry).clone();
        Some(state)
    }

    pub fn contains(&self, key: &str) -> bool {
        lock(&self.entries).contains_key(key)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Scoped ownership of a stream's state entry. Dropping it closes the stream.
#[derive(Debug)]
pub struct StreamLease {
    store: Arc<StreamStateStore>,
    key: String,
}

impl StreamLease {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &StreamStateStore {
        &self.store
    }
}

impl Drop for StreamLease {
    fn drop(&mut self) {
        self.store.close(&self.key);
    }
}
