//! Media engine side of a stream
//!
//! A [`FrameSource`] is the per-stream registration point of the media
//! engine. When installed it pushes every decoded frame into a
//! [`FrameSink`] from its own thread.

use crate::dispatcher::{DropReason, StreamDispatcher, StreamId, SubmitOutcome};
use nvr_video::{FrameView, VideoKind};
use parking_lot::RwLock;
use std::sync::{Arc, Weak};

/// Frame-ready callback registration with the media engine
pub trait FrameSource: Send {
    /// Start delivering frames of `kind` into `sink`
    fn install(&mut self, kind: VideoKind, sink: FrameSink);

    /// Stop delivering. Frames already being delivered may still arrive;
    /// the dispatcher rejects them once the stream is disabled.
    fn uninstall(&mut self);
}

/// Entry point handed to a [`FrameSource`]. Safe to call from any thread
/// and after the stream is gone.
#[derive(Clone)]
pub struct FrameSink {
    id: StreamId,
    stream: Weak<StreamDispatcher>,
}

impl FrameSink {
    pub fn new(stream: &Arc<StreamDispatcher>) -> Self {
        Self {
            id: stream.id(),
            stream: Arc::downgrade(stream),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.id
    }

    /// Hand one decoded frame to the stream. The view is copied before
    /// this returns.
    pub fn deliver(&self, frame: &FrameView<'_>) -> SubmitOutcome {
        match self.stream.upgrade() {
            Some(stream) => stream.submit(frame),
            None => SubmitOutcome::Dropped(DropReason::Disabled),
        }
    }
}

/// In-process source driven directly by the caller.
///
/// Clones share one registration, so a test or an embedding application
/// can keep a handle after giving the source to the renderer.
#[derive(Clone, Default)]
pub struct LocalFrameSource {
    slot: Arc<RwLock<Option<(VideoKind, FrameSink)>>>,
}

impl LocalFrameSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn installed_kind(&self) -> Option<VideoKind> {
        self.slot.read().as_ref().map(|(kind, _)| *kind)
    }

    /// Deliver `frame` if a sink is installed; `None` otherwise
    pub fn push(&self, frame: &FrameView<'_>) -> Option<SubmitOutcome> {
        // The sink is cloned out so a size-changed callback fired during
        // delivery may re-enter the renderer and uninstall this source.
        let sink = self.slot.read().as_ref().map(|(_, sink)| sink.clone())?;
        Some(sink.deliver(frame))
    }
}

impl FrameSource for LocalFrameSource {
    fn install(&mut self, kind: VideoKind, sink: FrameSink) {
        *self.slot.write() = Some((kind, sink));
    }

    fn uninstall(&mut self) {
        *self.slot.write() = None;
    }
}
