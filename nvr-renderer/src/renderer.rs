//! Renderer hub
//!
//! Owns the services shared by every stream (frame pool, dirty set and
//! size notifier), the stream registry and the render-thread device state.
//!
//! Lock order: render state, then the registry, dirty set or frame pool, then
//! a stream's instance lock. The producer path only ever takes the last two,
//! one at a time. A stream's source slot is taken alone and never held while
//! the source registers or unregisters, since a source may wait for
//! deliveries that call back into the renderer.

use crate::config::RendererConfig;
use crate::dispatcher::{DropReason, StreamDispatcher, StreamId, StreamStats, SubmitOutcome};
use crate::dirty::DirtySet;
use crate::error::RendererError;
use crate::notify::{SizeChangedCallback, SizeNotifier};
use crate::source::{FrameSink, FrameSource};
use crate::tick::{self, Device, TickReport};
use nvr_gpu::{DeviceEvent, RenderBackend, StagingPool, StagingPoolStats};
use nvr_video::{FramePool, FramePoolStats, FrameView, TextureDesc, VideoKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

struct SourceSlot {
    /// `None` while an install or uninstall runs outside the lock
    source: Option<Box<dyn FrameSource>>,
    installed: Option<VideoKind>,
}

struct StreamEntry {
    dispatcher: Arc<StreamDispatcher>,
    source: Mutex<SourceSlot>,
}

impl StreamEntry {
    /// Register the source for `kind` unless it already is. Skipped while
    /// another call has the source checked out.
    fn install_source(&self, kind: VideoKind) {
        let (mut source, previous) = {
            let mut slot = self.source.lock();
            if slot.installed == Some(kind) {
                return;
            }
            let Some(source) = slot.source.take() else {
                log::debug!(
                    "stream {}: source busy, {:?} registration skipped",
                    self.dispatcher.id(),
                    kind
                );
                return;
            };
            (source, slot.installed.take())
        };

        if previous.is_some() {
            source.uninstall();
        }
        source.install(kind, FrameSink::new(&self.dispatcher));

        let mut slot = self.source.lock();
        slot.source = Some(source);
        slot.installed = Some(kind);
    }

    /// Withdraw the registration. Returns false if nothing was installed.
    fn uninstall_source(&self) -> bool {
        let mut source = {
            let mut slot = self.source.lock();
            if slot.installed.is_none() {
                return false;
            }
            let Some(source) = slot.source.take() else {
                return false;
            };
            slot.installed = None;
            source
        };

        source.uninstall();
        self.source.lock().source = Some(source);
        true
    }
}

#[derive(Default)]
struct RenderState {
    device: Option<Device>,
    tick: u64,
    render_thread: Option<ThreadId>,
    last_report: Option<TickReport>,
}

/// Snapshot of renderer-wide counters
#[derive(Debug, Clone)]
pub struct RendererStats {
    pub backend: Option<&'static str>,
    /// Ticks completed since construction
    pub ticks: u64,
    pub streams: usize,
    pub dirty: usize,
    pub frame_pool: FramePoolStats,
    pub staging: Option<StagingPoolStats>,
    pub last_tick: Option<TickReport>,
}

pub struct Renderer {
    config: RwLock<RendererConfig>,
    frame_pool: Arc<FramePool>,
    dirty: Arc<DirtySet>,
    notifier: Arc<SizeNotifier>,
    streams: RwLock<HashMap<StreamId, Arc<StreamEntry>>>,
    next_stream: AtomicU64,
    render: Mutex<RenderState>,
}

impl Renderer {
    /// Create a renderer with no device. Frame-pool bounds are fixed here.
    pub fn new(config: RendererConfig) -> Result<Self, RendererError> {
        config.validate()?;

        Ok(Self {
            frame_pool: Arc::new(FramePool::new(
                config.max_free_frames,
                config.max_frame_objects,
            )),
            config: RwLock::new(config),
            dirty: Arc::new(DirtySet::new()),
            notifier: Arc::new(SizeNotifier::new()),
            streams: RwLock::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            render: Mutex::new(RenderState::default()),
        })
    }

    pub fn config(&self) -> RendererConfig {
        *self.config.read()
    }

    /// Replace the configuration. Staging parameters apply at the next
    /// device initialization; frame-pool bounds keep their initial values.
    pub fn reconfigure(&self, config: RendererConfig) -> Result<(), RendererError> {
        config.validate()?;
        let previous = std::mem::replace(&mut *self.config.write(), config);
        if (previous.max_free_frames, previous.max_frame_objects)
            != (config.max_free_frames, config.max_frame_objects)
        {
            log::info!("frame pool bounds are fixed at creation; keeping the initial values");
        }
        Ok(())
    }

    pub fn frame_pool(&self) -> &Arc<FramePool> {
        &self.frame_pool
    }

    pub fn is_initialized(&self) -> bool {
        self.render.lock().device.is_some()
    }

    /// Select `backend` and create the staging pool. An already initialized
    /// device is shut down first.
    pub fn initialize_device(
        &self,
        mut backend: Box<dyn RenderBackend>,
    ) -> Result<(), RendererError> {
        let config = self.config();
        let mut render = self.render.lock();

        if let Some(old) = render.device.take() {
            log::warn!(
                "device initialized twice; releasing the {} backend",
                old.backend.name()
            );
            release_device(old);
        }

        backend.on_device_event(DeviceEvent::Initialize)?;
        log::info!(
            "graphics device initialized with the {} backend (safe after {} ticks, evict after {})",
            backend.name(),
            config.frames_until_safe,
            config.frames_until_evict
        );

        render.device = Some(Device {
            backend,
            staging: StagingPool::new(config.frames_until_safe, config.frames_until_evict),
        });
        render.render_thread = None;
        Ok(())
    }

    /// Destroy every staging resource and drop the backend. Streams keep
    /// their state; pending frames are uploaded after the next Initialize.
    pub fn shutdown_device(&self) -> Result<(), RendererError> {
        let device = {
            let mut render = self.render.lock();
            render.render_thread = None;
            render.device.take().ok_or(RendererError::NotInitialized)?
        };

        let name = device.backend.name();
        let destroyed = release_device(device);
        let trimmed = self.frame_pool.trim();
        log::info!(
            "{} device shut down: {} staging resources destroyed, {} free frames released",
            name,
            destroyed,
            trimmed
        );
        Ok(())
    }

    /// Host device lifecycle notification. Initialize needs a backend and
    /// goes through [`Renderer::initialize_device`].
    pub fn on_device_event(&self, event: DeviceEvent) -> Result<(), RendererError> {
        match event {
            DeviceEvent::Initialize => Err(RendererError::BackendRequired),
            DeviceEvent::Shutdown => self.shutdown_device(),
            DeviceEvent::BeforeReset | DeviceEvent::AfterReset => {
                let mut render = self.render.lock();
                let device = render.device.as_mut().ok_or(RendererError::NotInitialized)?;
                if event == DeviceEvent::BeforeReset {
                    // Resources may not survive the reset
                    let destroyed = device.staging.clear(device.backend.as_mut());
                    log::debug!("device reset: {} staging resources destroyed", destroyed);
                }
                device.backend.on_device_event(event)?;
                Ok(())
            }
        }
    }

    /// Register a stream fed by `source`. The stream starts idle.
    pub fn create_stream(&self, source: Box<dyn FrameSource>) -> StreamId {
        let id = StreamId(self.next_stream.fetch_add(1, Ordering::Relaxed));
        let dispatcher = Arc::new(StreamDispatcher::new(
            id,
            self.frame_pool.clone(),
            self.dirty.clone(),
            self.notifier.clone(),
        ));
        let entry = Arc::new(StreamEntry {
            dispatcher,
            source: Mutex::new(SourceSlot {
                source: Some(source),
                installed: None,
            }),
        });

        self.streams.write().insert(id, entry);
        log::debug!("stream {} created", id);
        id
    }

    /// Disable and unregister a stream
    pub fn destroy_stream(&self, id: StreamId) -> Result<(), RendererError> {
        self.disable_stream(id)?;
        self.streams.write().remove(&id);
        self.dirty.remove(id);
        log::debug!("stream {} destroyed", id);
        Ok(())
    }

    /// Start listening: the media engine delivers frames, which only report
    /// their size until textures are bound.
    pub fn enable_stream(&self, id: StreamId, kind: VideoKind) -> Result<(), RendererError> {
        let entry = self.entry(id)?;
        entry.dispatcher.listen(kind)?;
        entry.install_source(kind);
        Ok(())
    }

    /// Bind destination textures, one per plane.
    ///
    /// Does not wait for the render thread, so it is safe from the
    /// size-changed callback. A tick already uploading this stream may still
    /// finish writing the previous textures; later ticks use the new ones.
    pub fn set_textures(
        &self,
        id: StreamId,
        kind: VideoKind,
        textures: &[TextureDesc],
    ) -> Result<(), RendererError> {
        let entry = self.entry(id)?;
        entry.dispatcher.set_textures(kind, textures)?;
        entry.install_source(kind);
        Ok(())
    }

    /// Withdraw the frame registration and go idle. Synchronous with both
    /// producers and the render tick: once this returns no frame of the
    /// stream is stored or uploaded.
    pub fn disable_stream(&self, id: StreamId) -> Result<(), RendererError> {
        let entry = self.entry(id)?;

        // The source may wait for in-progress deliveries, so no lock is held
        // while it uninstalls.
        entry.uninstall_source();

        let _render = self.render.lock();
        if entry.dispatcher.disable() {
            log::debug!("stream {} disabled", id);
        }
        Ok(())
    }

    /// Submit a frame directly, bypassing the stream's source
    pub fn submit_frame(&self, id: StreamId, frame: &FrameView<'_>) -> SubmitOutcome {
        match self.stream(id) {
            Some(stream) => stream.submit(frame),
            None => SubmitOutcome::Dropped(DropReason::Disabled),
        }
    }

    pub fn stream(&self, id: StreamId) -> Option<Arc<StreamDispatcher>> {
        self.streams
            .read()
            .get(&id)
            .map(|entry| entry.dispatcher.clone())
    }

    pub fn stream_ids(&self) -> Vec<StreamId> {
        let mut ids: Vec<_> = self.streams.read().keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn stream_stats(&self, id: StreamId) -> Option<StreamStats> {
        self.stream(id).map(|stream| stream.stats())
    }

    /// Install the size-changed callback, replacing any previous one.
    ///
    /// It runs on the producer thread that delivered the frame, with no
    /// renderer lock held. It may rebind textures but must not disable or
    /// destroy streams synchronously, since disabling waits for the source
    /// to finish delivering.
    pub fn set_size_changed_callback(&self, callback: Option<SizeChangedCallback>) {
        self.notifier.set(callback);
    }

    /// Upload every dirty stream's pending frame. Called once per displayed
    /// frame, always from the same render thread.
    pub fn render_tick(&self) -> Result<TickReport, RendererError> {
        let mut guard = self.render.lock();
        let render = &mut *guard;

        let current = std::thread::current().id();
        match render.render_thread {
            None => render.render_thread = Some(current),
            Some(owner) if owner != current => {
                log::error!("render tick called from a thread other than the render thread");
                debug_assert!(false, "render tick called off the render thread");
                return Err(RendererError::WrongThread);
            }
            Some(_) => {}
        }

        let device = render.device.as_mut().ok_or(RendererError::NotInitialized)?;
        let report = tick::run_tick(render.tick, device, &self.dirty, &self.frame_pool, |id| {
            self.stream(id)
        });

        render.tick += 1;
        render.last_report = Some(report);
        if report.failed > 0 {
            log::debug!(
                "tick {}: {} of {} streams failed",
                report.tick,
                report.failed,
                report.drained
            );
        }
        Ok(report)
    }

    pub fn stats(&self) -> RendererStats {
        let (backend, ticks, staging, last_tick) = {
            let render = self.render.lock();
            (
                render.device.as_ref().map(|d| d.backend.name()),
                render.tick,
                render.device.as_ref().map(|d| d.staging.stats()),
                render.last_report,
            )
        };

        RendererStats {
            backend,
            ticks,
            streams: self.streams.read().len(),
            dirty: self.dirty.len(),
            frame_pool: self.frame_pool.stats(),
            staging,
            last_tick,
        }
    }

    fn entry(&self, id: StreamId) -> Result<Arc<StreamEntry>, RendererError> {
        self.streams
            .read()
            .get(&id)
            .cloned()
            .ok_or(RendererError::UnknownStream(id))
    }
}

impl Default for Renderer {
    fn default() -> Self {
        Self {
            config: RwLock::new(RendererConfig::default()),
            frame_pool: Arc::new(FramePool::default()),
            dirty: Arc::new(DirtySet::new()),
            notifier: Arc::new(SizeNotifier::new()),
            streams: RwLock::new(HashMap::new()),
            next_stream: AtomicU64::new(1),
            render: Mutex::new(RenderState::default()),
        }
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        for (_, entry) in self.streams.get_mut().drain() {
            entry.uninstall_source();
            entry.dispatcher.disable();
        }
        if let Some(device) = self.render.get_mut().device.take() {
            release_device(device);
        }
    }
}

/// Destroy the device's staging resources and notify its backend
fn release_device(mut device: Device) -> usize {
    let destroyed = device.staging.clear(device.backend.as_mut());
    if let Err(err) = device.backend.on_device_event(DeviceEvent::Shutdown) {
        log::warn!("{}: shutdown failed: {}", device.backend.name(), err);
    }
    destroyed
}
