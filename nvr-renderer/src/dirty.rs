//! Streams with a pending frame awaiting the next render tick

use crate::StreamId;
use parking_lot::Mutex;
use std::collections::BTreeSet;

#[derive(Default)]
pub struct DirtySet {
    streams: Mutex<BTreeSet<StreamId>>,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` dirty. Returns false if it already was.
    pub fn insert(&self, id: StreamId) -> bool {
        self.streams.lock().insert(id)
    }

    pub fn remove(&self, id: StreamId) -> bool {
        self.streams.lock().remove(&id)
    }

    /// Snapshot and clear, in stream id order
    pub fn drain(&self) -> Vec<StreamId> {
        let drained = std::mem::take(&mut *self.streams.lock());
        drained.into_iter().collect()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.lock().is_empty()
    }
}
