//! Per-stream latest-wins frame handoff
//!
//! Producers call [`StreamDispatcher::submit`] from their own threads; the
//! render tick takes the single pending frame with
//! [`StreamDispatcher::take_pending`]. Frame data is copied into a pooled
//! object outside the instance lock, and only the object is swapped under
//! it. Pool and dirty-set locks are never taken while the instance lock is
//! held.

use crate::dirty::DirtySet;
use crate::error::RendererError;
use crate::notify::SizeNotifier;
use nvr_video::{FrameObject, FramePool, FrameView, TextureDesc, VideoKind};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Renderer-assigned identity of a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamId(pub u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Drops every frame
    Idle,
    /// Registered with the media engine but no destination bound; frames
    /// only produce size-changed notifications
    Listening,
    /// Destination bound, frames are queued for upload
    Armed,
}

/// What happened to one submitted frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Stored in an empty pending slot
    Queued,
    /// Stored, and an unconsumed older frame went back to the pool
    Replaced,
    /// Size differs from the bound textures; nothing stored
    SizeChanged,
    Dropped(DropReason),
}

impl SubmitOutcome {
    pub fn is_stored(self) -> bool {
        matches!(self, SubmitOutcome::Queued | SubmitOutcome::Replaced)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Stream idle, or disabled while the frame was being copied
    Disabled,
    /// Missing plane, bad stride or zero size
    Malformed,
    /// Frame layout differs from the stream's kind
    KindMismatch,
    /// Frame pool at its live-object limit, or out of memory
    PoolExhausted,
    /// Destination rebound while the frame was being copied
    Rebound,
}

/// Frame taken by the render tick together with its destinations
#[derive(Debug)]
pub struct PendingUpload {
    pub stream: StreamId,
    pub frame: FrameObject,
    pub textures: Vec<TextureDesc>,
}

struct StreamState {
    mode: StreamMode,
    kind: VideoKind,
    textures: Vec<TextureDesc>,
    pending: Option<FrameObject>,
    /// Last size reported to the host since the textures were bound
    notified_size: Option<(u32, u32)>,
}

impl StreamState {
    fn bound_size(&self) -> Option<(u32, u32)> {
        match self.mode {
            StreamMode::Armed => self.textures.first().map(|t| (t.width, t.height)),
            _ => None,
        }
    }
}

#[derive(Default)]
struct StreamCounters {
    submitted: AtomicU64,
    queued: AtomicU64,
    replaced: AtomicU64,
    dropped: AtomicU64,
    size_changes: AtomicU64,
    uploaded: AtomicU64,
    upload_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamStats {
    pub submitted: u64,
    /// Frames stored in the pending slot, including replacements
    pub queued: u64,
    /// Stored frames discarded unconsumed by a newer one
    pub replaced: u64,
    pub dropped: u64,
    pub size_changes: u64,
    pub uploaded: u64,
    pub upload_failures: u64,
}

pub struct StreamDispatcher {
    id: StreamId,
    state: Mutex<StreamState>,
    frame_pool: Arc<FramePool>,
    dirty: Arc<DirtySet>,
    notifier: Arc<SizeNotifier>,
    counters: StreamCounters,
}

impl StreamDispatcher {
    /// Create an idle dispatcher sharing the given services
    pub fn new(
        id: StreamId,
        frame_pool: Arc<FramePool>,
        dirty: Arc<DirtySet>,
        notifier: Arc<SizeNotifier>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(StreamState {
                mode: StreamMode::Idle,
                kind: VideoKind::None,
                textures: Vec::new(),
                pending: None,
                notified_size: None,
            }),
            frame_pool,
            dirty,
            notifier,
            counters: StreamCounters::default(),
        }
    }

    pub fn id(&self) -> StreamId {
        self.id
    }

    pub fn mode(&self) -> StreamMode {
        self.state.lock().mode
    }

    pub fn kind(&self) -> VideoKind {
        self.state.lock().kind
    }

    pub fn textures(&self) -> Vec<TextureDesc> {
        self.state.lock().textures.clone()
    }

    pub fn has_pending(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Serial of the pending frame object, if any
    pub fn pending_serial(&self) -> Option<u64> {
        self.state.lock().pending.as_ref().map(FrameObject::serial)
    }

    /// Idle -> Listening. A bound stream keeps its textures.
    pub fn listen(&self, kind: VideoKind) -> Result<(), RendererError> {
        if kind == VideoKind::None {
            return Err(RendererError::UnsupportedKind(kind));
        }

        let mut state = self.state.lock();
        match state.mode {
            StreamMode::Armed if state.kind != kind => Err(RendererError::KindMismatch {
                id: self.id,
                current: state.kind,
                requested: kind,
            }),
            StreamMode::Armed => Ok(()),
            StreamMode::Idle | StreamMode::Listening => {
                state.mode = StreamMode::Listening;
                state.kind = kind;
                Ok(())
            }
        }
    }

    /// Bind one destination per plane (-> Armed). Rebinding replaces the
    /// descriptors and discards a pending frame that no longer fits.
    pub fn set_textures(
        &self,
        kind: VideoKind,
        textures: &[TextureDesc],
    ) -> Result<(), RendererError> {
        let usable = |t: &TextureDesc| !t.texture.is_null() && t.width > 0 && t.height > 0;
        if !kind.accepts_texture_count(textures.len()) || !textures.iter().all(usable) {
            return Err(RendererError::InvalidTextures {
                kind,
                count: textures.len(),
            });
        }

        let stale = {
            let mut state = self.state.lock();
            let size = (textures[0].width, textures[0].height);
            let fits = state.kind == kind && state.bound_size() == Some(size);

            state.mode = StreamMode::Armed;
            state.kind = kind;
            state.textures.clear();
            state.textures.extend_from_slice(textures);
            state.notified_size = None;

            if fits {
                None
            } else {
                state.pending.take()
            }
        };

        if stale.is_some() {
            self.dirty.remove(self.id);
        }
        self.frame_pool.release(stale);

        log::debug!(
            "stream {}: bound {} {:?} textures at {}x{}",
            self.id,
            textures.len(),
            kind,
            textures[0].width,
            textures[0].height
        );
        Ok(())
    }

    /// -> Idle. No frame is accepted once this returns, and a pending frame
    /// goes back to the pool. Returns false if already idle.
    pub fn disable(&self) -> bool {
        let (was_active, stale) = {
            let mut state = self.state.lock();
            let was_active = state.mode != StreamMode::Idle;
            state.mode = StreamMode::Idle;
            state.textures.clear();
            state.notified_size = None;
            (was_active, state.pending.take())
        };

        self.frame_pool.release(stale);
        self.dirty.remove(self.id);
        was_active
    }

    /// Accept a frame from a producer thread. Never blocks on the render
    /// thread and never reports an error; rejected frames are dropped.
    pub fn submit(&self, frame: &FrameView<'_>) -> SubmitOutcome {
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let outcome = self.try_submit(frame);
        let counter = match outcome {
            SubmitOutcome::Queued => &self.counters.queued,
            SubmitOutcome::Replaced => {
                self.counters.replaced.fetch_add(1, Ordering::Relaxed);
                &self.counters.queued
            }
            SubmitOutcome::SizeChanged => &self.counters.size_changes,
            SubmitOutcome::Dropped(reason) => {
                log::trace!("stream {}: frame dropped ({:?})", self.id, reason);
                &self.counters.dropped
            }
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    fn try_submit(&self, frame: &FrameView<'_>) -> SubmitOutcome {
        let (mode, kind, bound) = {
            let state = self.state.lock();
            (state.mode, state.kind, state.bound_size())
        };

        if mode == StreamMode::Idle {
            return SubmitOutcome::Dropped(DropReason::Disabled);
        }
        if frame.kind != kind {
            return SubmitOutcome::Dropped(DropReason::KindMismatch);
        }
        if let Err(err) = frame.validate() {
            log::trace!("stream {}: {}", self.id, err);
            return SubmitOutcome::Dropped(DropReason::Malformed);
        }

        let size = (frame.width, frame.height);
        if bound != Some(size) {
            self.report_size(size);
            return SubmitOutcome::SizeChanged;
        }

        let Some(mut object) = self.frame_pool.acquire() else {
            return SubmitOutcome::Dropped(DropReason::PoolExhausted);
        };
        if let Err(err) = object.copy_from(frame) {
            log::debug!("stream {}: frame copy failed: {}", self.id, err);
            self.frame_pool.release(object);
            return SubmitOutcome::Dropped(DropReason::PoolExhausted);
        }

        let swapped = {
            let mut state = self.state.lock();
            if state.mode == StreamMode::Idle {
                Err((object, DropReason::Disabled))
            } else if state.kind != frame.kind || state.bound_size() != Some(size) {
                Err((object, DropReason::Rebound))
            } else {
                object.mark_pending();
                state.notified_size = None;
                Ok(state.pending.replace(object))
            }
        };

        match swapped {
            Ok(stale) => {
                let replaced = stale.is_some();
                self.frame_pool.release(stale);
                self.dirty.insert(self.id);
                if replaced {
                    SubmitOutcome::Replaced
                } else {
                    SubmitOutcome::Queued
                }
            }
            Err((object, reason)) => {
                self.frame_pool.release(object);
                SubmitOutcome::Dropped(reason)
            }
        }
    }

    /// Fire the size-changed notification once per distinct size
    fn report_size(&self, size: (u32, u32)) {
        let first = {
            let mut state = self.state.lock();
            if state.mode == StreamMode::Idle || state.notified_size == Some(size) {
                false
            } else {
                state.notified_size = Some(size);
                true
            }
        };

        if first {
            log::debug!("stream {}: frame size changed to {}x{}", self.id, size.0, size.1);
            self.notifier.notify(size.0, size.1, self.id);
        }
    }

    /// Move the pending frame out for upload. Render thread only.
    pub fn take_pending(&self) -> Option<PendingUpload> {
        let mut state = self.state.lock();
        if state.mode != StreamMode::Armed {
            return None;
        }
        let mut frame = state.pending.take()?;
        frame.mark_in_flight();

        Some(PendingUpload {
            stream: self.id,
            frame,
            textures: state.textures.clone(),
        })
    }

    pub(crate) fn record_upload(&self, ok: bool) {
        let counter = if ok {
            &self.counters.uploaded
        } else {
            &self.counters.upload_failures
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StreamStats {
        let c = &self.counters;
        StreamStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            queued: c.queued.load(Ordering::Relaxed),
            replaced: c.replaced.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            size_changes: c.size_changes.load(Ordering::Relaxed),
            uploaded: c.uploaded.load(Ordering::Relaxed),
            upload_failures: c.upload_failures.load(Ordering::Relaxed),
        }
    }
}

impl Drop for StreamDispatcher {
    fn drop(&mut self) {
        if let Some(frame) = self.state.get_mut().pending.take() {
            self.frame_pool.release(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nvr_video::{FrameState, TextureHandle};

    struct Fixture {
        pool: Arc<FramePool>,
        dirty: Arc<DirtySet>,
        notifier: Arc<SizeNotifier>,
        stream: StreamDispatcher,
    }

    fn fixture() -> Fixture {
        let pool = Arc::new(FramePool::new(8, 16));
        let dirty = Arc::new(DirtySet::new());
        let notifier = Arc::new(SizeNotifier::new());
        let stream =
            StreamDispatcher::new(StreamId(1), pool.clone(), dirty.clone(), notifier.clone());
        Fixture {
            pool,
            dirty,
            notifier,
            stream,
        }
    }

    fn argb_textures(width: u32, height: u32) -> [TextureDesc; 1] {
        [TextureDesc::new(TextureHandle(1), width, height)]
    }

    fn argb(width: u32, height: u32, data: &[u8]) -> FrameView<'_> {
        FrameView::argb(width, height, data, width * 4)
    }

    #[test]
    fn test_idle_drops() {
        let f = fixture();
        let data = vec![0u8; 16 * 16 * 4];

        assert_eq!(
            f.stream.submit(&argb(16, 16, &data)),
            SubmitOutcome::Dropped(DropReason::Disabled)
        );
        assert_eq!(f.pool.stats().created, 0);
        assert!(f.dirty.is_empty());
    }

    #[test]
    fn test_queue_then_replace() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(16, 16)).unwrap();
        let data = vec![0u8; 16 * 16 * 4];

        assert_eq!(f.stream.submit(&argb(16, 16, &data)), SubmitOutcome::Queued);
        assert_eq!(f.stream.submit(&argb(16, 16, &data)), SubmitOutcome::Replaced);
        assert_eq!(f.stream.submit(&argb(16, 16, &data)), SubmitOutcome::Replaced);

        let stats = f.pool.stats();
        assert_eq!(stats.outstanding, 1, "only the latest frame is retained");
        assert_eq!(f.dirty.len(), 1);

        let s = f.stream.stats();
        assert_eq!((s.submitted, s.queued, s.replaced), (3, 3, 2));
    }

    #[test]
    fn test_take_pending() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(4, 4)).unwrap();
        let data: Vec<u8> = (0..64).collect();
        f.stream.submit(&argb(4, 4, &data));

        let upload = f.stream.take_pending().unwrap();
        assert_eq!(upload.stream, StreamId(1));
        assert_eq!(upload.frame.state(), FrameState::InFlight);
        assert_eq!(upload.frame.desc().plane(0).unwrap(), data.as_slice());
        assert_eq!(upload.textures.len(), 1);
        assert!(f.stream.take_pending().is_none());

        f.pool.release(upload.frame);
        assert_eq!(f.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_size_change_notifies_once() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.notifier.set(Some(Arc::new(move |w: u32, h: u32, id: StreamId| {
            sink.lock().push((w, h, id))
        })));

        f.stream
            .set_textures(VideoKind::Argb, &argb_textures(1920, 1080))
            .unwrap();
        let data = vec![0u8; 1280 * 720 * 4];

        assert_eq!(f.stream.submit(&argb(1280, 720, &data)), SubmitOutcome::SizeChanged);
        assert_eq!(f.stream.submit(&argb(1280, 720, &data)), SubmitOutcome::SizeChanged);
        assert!(!f.stream.has_pending());
        assert_eq!(*seen.lock(), vec![(1280, 720, StreamId(1))]);

        // Rebinding at the new size accepts the frames
        f.stream
            .set_textures(VideoKind::Argb, &argb_textures(1280, 720))
            .unwrap();
        assert_eq!(f.stream.submit(&argb(1280, 720, &data)), SubmitOutcome::Queued);
        assert_eq!(seen.lock().len(), 1);
    }

    #[test]
    fn test_listening_reports_size() {
        let f = fixture();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        f.notifier.set(Some(Arc::new(move |w: u32, h: u32, _: StreamId| {
            sink.lock().push((w, h))
        })));

        f.stream.listen(VideoKind::Argb).unwrap();
        let data = vec![0u8; 8 * 8 * 4];
        assert_eq!(f.stream.submit(&argb(8, 8, &data)), SubmitOutcome::SizeChanged);
        assert_eq!(*seen.lock(), vec![(8, 8)]);
        assert_eq!(f.pool.stats().created, 0);
    }

    #[test]
    fn test_malformed_and_mismatched_frames() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(8, 8)).unwrap();

        let short = vec![0u8; 10];
        assert_eq!(
            f.stream.submit(&argb(8, 8, &short)),
            SubmitOutcome::Dropped(DropReason::Malformed)
        );

        let y = vec![0u8; 64];
        let uv = vec![0u8; 16];
        let i420 = FrameView::i420(8, 8, [y.as_slice(), &uv, &uv], [8, 4, 4], None);
        assert_eq!(
            f.stream.submit(&i420),
            SubmitOutcome::Dropped(DropReason::KindMismatch)
        );
        assert_eq!(f.stream.stats().dropped, 2);
    }

    #[test]
    fn test_invalid_textures_rejected() {
        let f = fixture();
        let tex = TextureDesc::new(TextureHandle(1), 8, 8);

        assert!(matches!(
            f.stream.set_textures(VideoKind::I420, &[tex, tex]),
            Err(RendererError::InvalidTextures { count: 2, .. })
        ));
        assert!(f
            .stream
            .set_textures(VideoKind::Argb, &[TextureDesc::new(TextureHandle(0), 8, 8)])
            .is_err());
        assert_eq!(f.stream.mode(), StreamMode::Idle);

        assert!(f.stream.set_textures(VideoKind::I420, &[tex, tex, tex]).is_ok());
        assert!(f.stream.set_textures(VideoKind::I420, &[tex, tex, tex, tex]).is_ok());
    }

    #[test]
    fn test_listen_kind_checks() {
        let f = fixture();
        assert!(f.stream.listen(VideoKind::None).is_err());

        f.stream.set_textures(VideoKind::Argb, &argb_textures(8, 8)).unwrap();
        assert!(f.stream.listen(VideoKind::Argb).is_ok());
        assert_eq!(f.stream.mode(), StreamMode::Armed);
        assert!(matches!(
            f.stream.listen(VideoKind::I420),
            Err(RendererError::KindMismatch { .. })
        ));
    }

    #[test]
    fn test_disable_returns_pending() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(8, 8)).unwrap();
        let data = vec![0u8; 8 * 8 * 4];
        f.stream.submit(&argb(8, 8, &data));
        assert_eq!(f.pool.stats().outstanding, 1);

        assert!(f.stream.disable());
        assert!(!f.stream.disable());
        assert_eq!(f.pool.stats().outstanding, 0);
        assert!(f.dirty.is_empty());
        assert!(f.stream.take_pending().is_none());
        assert_eq!(
            f.stream.submit(&argb(8, 8, &data)),
            SubmitOutcome::Dropped(DropReason::Disabled)
        );
    }

    #[test]
    fn test_rebind_discards_unfit_pending() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(8, 8)).unwrap();
        let data = vec![0u8; 8 * 8 * 4];
        f.stream.submit(&argb(8, 8, &data));

        // Same size keeps the frame
        f.stream.set_textures(VideoKind::Argb, &argb_textures(8, 8)).unwrap();
        assert!(f.stream.has_pending());

        f.stream.set_textures(VideoKind::Argb, &argb_textures(16, 16)).unwrap();
        assert!(!f.stream.has_pending());
        assert_eq!(f.pool.stats().outstanding, 0);
    }

    #[test]
    fn test_pool_exhaustion_drops() {
        let pool = Arc::new(FramePool::new(1, 1));
        let stream = StreamDispatcher::new(
            StreamId(2),
            pool.clone(),
            Arc::new(DirtySet::new()),
            Arc::new(SizeNotifier::new()),
        );
        stream.set_textures(VideoKind::Argb, &argb_textures(2, 2)).unwrap();
        let data = vec![0u8; 16];

        assert_eq!(stream.submit(&argb(2, 2, &data)), SubmitOutcome::Queued);
        // The only object sits in the pending slot
        assert_eq!(
            stream.submit(&argb(2, 2, &data)),
            SubmitOutcome::Dropped(DropReason::PoolExhausted)
        );
    }

    #[test]
    fn test_drop_returns_pending() {
        let f = fixture();
        f.stream.set_textures(VideoKind::Argb, &argb_textures(2, 2)).unwrap();
        f.stream.submit(&argb(2, 2, &[0u8; 16]));

        let pool = f.pool.clone();
        drop(f);
        assert_eq!(pool.stats().outstanding, 0);
    }
}
