//! Process-wide renderer and C handle bookkeeping

use crate::backend_ffi::NvrBackendVtable;
use crate::source_ffi::NvrTrackHandle;
use nvr_gpu::HostBackend;
use nvr_renderer::{Renderer, RendererConfig, RendererError, StreamId};
use parking_lot::{const_mutex, const_rwlock, Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

static RENDERER: RwLock<Option<Arc<Renderer>>> = const_rwlock(None);

/// Applied when the renderer is created or reconfigured
pub(crate) static CONFIG: Mutex<Option<RendererConfig>> = const_mutex(None);

pub(crate) static VTABLE: Mutex<Option<NvrBackendVtable>> = const_mutex(None);

/// In-process backend of the current device, if that kind was selected
pub(crate) static HOST: Mutex<Option<HostBackend>> = const_mutex(None);

pub(crate) static BINDINGS: Mutex<Bindings> = const_mutex(Bindings::new());

/// Track handle <-> stream mapping. Never held across a renderer call.
pub(crate) struct Bindings {
    by_track: BTreeMap<usize, StreamId>,
    by_stream: BTreeMap<StreamId, usize>,
}

impl Bindings {
    const fn new() -> Self {
        Self {
            by_track: BTreeMap::new(),
            by_stream: BTreeMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, track: NvrTrackHandle, id: StreamId) {
        self.by_track.insert(track as usize, id);
        self.by_stream.insert(id, track as usize);
    }

    pub(crate) fn remove_track(&mut self, track: NvrTrackHandle) -> Option<StreamId> {
        let id = self.by_track.remove(&(track as usize))?;
        self.by_stream.remove(&id);
        Some(id)
    }

    pub(crate) fn remove_stream(&mut self, id: StreamId) -> Option<NvrTrackHandle> {
        let track = self.by_stream.remove(&id)?;
        self.by_track.remove(&track);
        Some(track as NvrTrackHandle)
    }

    pub(crate) fn track(&self, id: StreamId) -> Option<NvrTrackHandle> {
        self.by_stream.get(&id).map(|&track| track as NvrTrackHandle)
    }
}

/// The renderer, if something already created it
pub(crate) fn current() -> Option<Arc<Renderer>> {
    RENDERER.read().clone()
}

/// The renderer, created with the pending configuration on first use
pub(crate) fn renderer() -> Result<Arc<Renderer>, RendererError> {
    if let Some(renderer) = current() {
        return Ok(renderer);
    }

    let mut slot = RENDERER.write();
    if let Some(renderer) = slot.as_ref() {
        return Ok(renderer.clone());
    }
    let config = (*CONFIG.lock()).unwrap_or_default();
    let renderer = Arc::new(Renderer::new(config)?);
    log::info!("renderer created ({} frame objects max)", config.max_frame_objects);
    *slot = Some(renderer.clone());
    Ok(renderer)
}
