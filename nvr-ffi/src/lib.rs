//! NVR FFI - C Foreign Function Interface
//!
//! C ABI used by the host engine (device lifecycle, texture binding, the
//! per-frame update method) and by the media engine (frame callbacks).
//! A single renderer serves the whole process.

use bytemuck::{Pod, Zeroable};
use libc::{c_char, c_void};
use nvr_gpu::{DeviceEvent, HostBackend, RenderBackend};
use nvr_renderer::{RendererConfig, RendererError, StreamId, StreamStats};
use nvr_video::{PixelFormat, TextureDesc, TextureHandle, VideoKind};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

mod backend_ffi;
mod logging;
mod source_ffi;
mod state;

pub use backend_ffi::{
    NvrBackendVtable, NvrBeginWriteFn, NvrCopyToTextureFn, NvrCreateStagingFn,
    NvrDestroyStagingFn, NvrDeviceEventFn, NvrEndWriteFn, NvrRect,
};
pub use logging::NvrLogFunction;
pub use source_ffi::{
    NvrArgb32Frame, NvrArgb32FrameCallback, NvrFrameRegistration, NvrI420AFrame,
    NvrI420AFrameCallback, NvrRegisterArgb32Fn, NvrRegisterI420AFn, NvrTrackHandle,
};

use backend_ffi::ForeignBackend;
use source_ffi::ForeignFrameSource;
use state::{BINDINGS, CONFIG, HOST, VTABLE};

/// Result codes of the C API
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvrResult {
    Success = 0,
    InvalidParameter = 1,
    NotInitialized = 2,
    UnknownObject = 3,
    Unsupported = 4,
    InvalidState = 5,
}

impl From<&RendererError> for NvrResult {
    fn from(err: &RendererError) -> Self {
        match err {
            RendererError::NotInitialized => NvrResult::NotInitialized,
            RendererError::UnknownStream(_) => NvrResult::UnknownObject,
            RendererError::InvalidTextures { .. } | RendererError::Config(_) => {
                NvrResult::InvalidParameter
            }
            RendererError::UnsupportedKind(_) => NvrResult::Unsupported,
            RendererError::BackendRequired
            | RendererError::KindMismatch { .. }
            | RendererError::WrongThread
            | RendererError::Backend(_) => NvrResult::InvalidState,
        }
    }
}

fn result_code(result: Result<(), RendererError>) -> NvrResult {
    match result {
        Ok(()) => NvrResult::Success,
        Err(err) => {
            log::warn!("{}", err);
            NvrResult::from(&err)
        }
    }
}

/// Run `f`, turning a panic into `fallback` so it never unwinds into C
pub(crate) fn guard<T>(fallback: T, f: impl FnOnce() -> T) -> T {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(_) => {
            log::error!("panic caught at the C boundary");
            fallback
        }
    }
}

/// Renderer-side stream handle. 0 is never a valid handle.
pub type NvrStreamHandle = u64;

/// Which graphics backend the device uses
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvrBackendKind {
    /// CPU memory, for headless hosts and tests
    Host = 0,
    /// Table registered with `nvr_set_backend_vtable`
    Foreign = 1,
}

impl NvrBackendKind {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(NvrBackendKind::Host),
            1 => Some(NvrBackendKind::Foreign),
            _ => None,
        }
    }
}

/// C-compatible destination texture
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvrTextureDesc {
    pub texture: *mut c_void,
    pub width: i32,
    pub height: i32,
}

/// C-compatible renderer configuration
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct NvrRendererConfig {
    pub frames_until_safe: u64,
    pub frames_until_evict: u64,
    pub max_free_frames: u32,
    pub max_frame_objects: u32,
}

impl From<RendererConfig> for NvrRendererConfig {
    fn from(config: RendererConfig) -> Self {
        Self {
            frames_until_safe: config.frames_until_safe,
            frames_until_evict: config.frames_until_evict,
            max_free_frames: config.max_free_frames.min(u32::MAX as usize) as u32,
            max_frame_objects: config.max_frame_objects.min(u32::MAX as usize) as u32,
        }
    }
}

impl From<NvrRendererConfig> for RendererConfig {
    fn from(config: NvrRendererConfig) -> Self {
        RendererConfig {
            frames_until_safe: config.frames_until_safe,
            frames_until_evict: config.frames_until_evict,
            max_free_frames: config.max_free_frames as usize,
            max_frame_objects: config.max_frame_objects as usize,
        }
    }
}

/// C-compatible per-stream counters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pod, Zeroable)]
pub struct NvrStreamStats {
    pub submitted: u64,
    pub queued: u64,
    pub replaced: u64,
    pub dropped: u64,
    pub size_changes: u64,
    pub uploaded: u64,
    pub upload_failures: u64,
}

impl From<StreamStats> for NvrStreamStats {
    fn from(stats: StreamStats) -> Self {
        Self {
            submitted: stats.submitted,
            queued: stats.queued,
            replaced: stats.replaced,
            dropped: stats.dropped,
            size_changes: stats.size_changes,
            uploaded: stats.uploaded,
            upload_failures: stats.upload_failures,
        }
    }
}

/// Called by the host once per displayed frame on its render thread
pub type NvrVideoUpdateMethod = extern "C" fn();

/// Fired on a media engine thread when a stream's frames no longer fit its
/// bound textures. Must not disable or destroy the stream synchronously.
pub type NvrTextureSizeChangedCallback =
    unsafe extern "C" fn(width: i32, height: i32, track: NvrTrackHandle);

// ============================================================================
// LIBRARY SETUP
// ============================================================================

/// Get library version string
#[no_mangle]
pub extern "C" fn nvr_version() -> *const c_char {
    concat!(env!("CARGO_PKG_VERSION"), "\0").as_ptr() as *const c_char
}

/// Route library logs to the host. Any callback may be null; records of
/// that severity are then discarded.
///
/// # Safety
/// Callbacks must stay valid until replaced and accept calls from any thread.
#[no_mangle]
pub unsafe extern "C" fn nvr_set_logging_functions(
    log_debug: Option<NvrLogFunction>,
    log_error: Option<NvrLogFunction>,
    log_warning: Option<NvrLogFunction>,
) {
    guard((), || logging::set_callbacks(log_debug, log_error, log_warning))
}

/// Set the renderer configuration.
///
/// Staging parameters take effect at the next device initialization.
/// Frame-pool bounds only apply if the renderer has not been created yet.
///
/// # Safety
/// `config` must be null or point to a valid `NvrRendererConfig`.
#[no_mangle]
pub unsafe extern "C" fn nvr_configure(config: *const NvrRendererConfig) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(config) = (unsafe { config.as_ref() }) else {
            return NvrResult::InvalidParameter;
        };
        let config = RendererConfig::from(*config);
        if let Err(err) = config.validate() {
            log::warn!("rejected configuration: {}", err);
            return NvrResult::InvalidParameter;
        }

        *CONFIG.lock() = Some(config);
        match state::current() {
            Some(renderer) => result_code(renderer.reconfigure(config)),
            None => NvrResult::Success,
        }
    })
}

/// Write the configuration in effect (or pending) into `out`
///
/// # Safety
/// `out` must be null or point to writable memory for an `NvrRendererConfig`.
#[no_mangle]
pub unsafe extern "C" fn nvr_get_configuration(out: *mut NvrRendererConfig) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(out) = (unsafe { out.as_mut() }) else {
            return NvrResult::InvalidParameter;
        };
        let config = match state::current() {
            Some(renderer) => renderer.config(),
            None => (*CONFIG.lock()).unwrap_or_default(),
        };
        *out = config.into();
        NvrResult::Success
    })
}

/// Register the host's graphics backend, used when the device initializes
/// with `NvrBackendKind::Foreign`. Null clears the registration.
///
/// # Safety
/// `vtable` must be null or point to a valid table whose functions and
/// context stay valid until the device shuts down.
#[no_mangle]
pub unsafe extern "C" fn nvr_set_backend_vtable(vtable: *const NvrBackendVtable) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let vtable = unsafe { vtable.as_ref() }.copied();
        if let Some(table) = &vtable {
            if ForeignBackend::new(table).is_none() {
                return NvrResult::InvalidParameter;
            }
        }
        *VTABLE.lock() = vtable;
        NvrResult::Success
    })
}

// ============================================================================
// DEVICE LIFECYCLE
// ============================================================================

fn create_backend(kind: NvrBackendKind) -> Result<Box<dyn RenderBackend>, RendererError> {
    match kind {
        NvrBackendKind::Host => {
            let host = HostBackend::new();
            *HOST.lock() = Some(host.clone());
            Ok(Box::new(host))
        }
        NvrBackendKind::Foreign => {
            let vtable = (*VTABLE.lock()).ok_or(RendererError::BackendRequired)?;
            let backend = ForeignBackend::new(&vtable).ok_or(RendererError::BackendRequired)?;
            Ok(Box::new(backend))
        }
    }
}

/// Host graphics device notification (`event`: 0 Initialize, 1 Shutdown,
/// 2 BeforeReset, 3 AfterReset). `backend_kind` selects the backend on
/// Initialize and is ignored otherwise.
///
/// # Safety
/// Safe to call; must be called on the host's render thread.
#[no_mangle]
pub unsafe extern "C" fn nvr_on_graphics_device_event(event: i32, backend_kind: i32) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(event) = DeviceEvent::from_raw(event) else {
            return NvrResult::InvalidParameter;
        };
        let renderer = match state::renderer() {
            Ok(renderer) => renderer,
            Err(err) => return result_code(Err(err)),
        };

        match event {
            DeviceEvent::Initialize => {
                let Some(kind) = NvrBackendKind::from_raw(backend_kind) else {
                    return NvrResult::InvalidParameter;
                };
                result_code(create_backend(kind).and_then(|b| renderer.initialize_device(b)))
            }
            DeviceEvent::Shutdown => {
                let result = renderer.shutdown_device();
                *HOST.lock() = None;
                result_code(result)
            }
            DeviceEvent::BeforeReset | DeviceEvent::AfterReset => {
                result_code(renderer.on_device_event(event))
            }
        }
    })
}

/// Create a destination texture on the in-process backend. Returns null
/// if that backend is not the current device or the format is unknown.
///
/// # Safety
/// Safe to call.
#[no_mangle]
pub unsafe extern "C" fn nvr_host_create_texture(
    format: u32,
    width: u32,
    height: u32,
) -> *mut c_void {
    guard(std::ptr::null_mut(), || {
        let (Some(host), Some(format)) = (HOST.lock().clone(), PixelFormat::from_raw(format)) else {
            return std::ptr::null_mut();
        };
        host.create_texture(format, width, height).0 as *mut c_void
    })
}

// ============================================================================
// STREAM API
// ============================================================================

/// Create a renderer stream reading frames from `track`. A stream already
/// created for the same track is destroyed first. Returns 0 on failure.
///
/// # Safety
/// `registration` must be null or valid; its functions and `track` must
/// stay valid until the stream is destroyed.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_create(
    track: NvrTrackHandle,
    registration: *const NvrFrameRegistration,
) -> NvrStreamHandle {
    guard(0, || {
        let Some(registration) = (unsafe { registration.as_ref() }).copied() else {
            return 0;
        };
        if track.is_null()
            || (registration.register_i420a.is_none() && registration.register_argb32.is_none())
        {
            return 0;
        }
        let renderer = match state::renderer() {
            Ok(renderer) => renderer,
            Err(err) => {
                log::error!("renderer unavailable: {}", err);
                return 0;
            }
        };

        let previous = BINDINGS.lock().remove_track(track);
        if let Some(previous) = previous {
            log::debug!("track recreated; destroying stream {}", previous);
            if let Err(err) = renderer.destroy_stream(previous) {
                log::warn!("stream {}: destroy on recreate failed: {}", previous, err);
            }
        }

        let id = renderer.create_stream(Box::new(ForeignFrameSource::new(track, registration)));
        BINDINGS.lock().insert(track, id);
        id.0
    })
}

/// Disable and destroy a stream
///
/// # Safety
/// Safe to call with any handle.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_destroy(handle: NvrStreamHandle) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(renderer) = state::current() else {
            return NvrResult::UnknownObject;
        };
        let id = StreamId(handle);
        BINDINGS.lock().remove_stream(id);
        result_code(renderer.destroy_stream(id))
    })
}

/// Start receiving frames (`kind`: 1 I420, 2 ARGB). Until textures are
/// bound, frames only trigger the size-changed callback.
///
/// # Safety
/// Safe to call with any handle.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_enable_remote_video(
    handle: NvrStreamHandle,
    kind: i32,
) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(kind) = VideoKind::from_raw(kind) else {
            return NvrResult::InvalidParameter;
        };
        let Some(renderer) = state::current() else {
            return NvrResult::UnknownObject;
        };
        result_code(renderer.enable_stream(StreamId(handle), kind))
    })
}

/// Bind the textures a stream renders into, one per plane. Usually called
/// in response to the size-changed callback.
///
/// # Safety
/// `textures` must point to `texture_count` valid descriptors.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_update_remote_textures(
    handle: NvrStreamHandle,
    kind: i32,
    textures: *const NvrTextureDesc,
    texture_count: i32,
) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(kind) = VideoKind::from_raw(kind) else {
            return NvrResult::InvalidParameter;
        };
        if texture_count < 0 || (textures.is_null() && texture_count > 0) {
            return NvrResult::InvalidParameter;
        }
        let descs: &[NvrTextureDesc] = if texture_count == 0 {
            &[]
        } else {
            unsafe { std::slice::from_raw_parts(textures, texture_count as usize) }
        };

        let mut bound = Vec::with_capacity(descs.len());
        for desc in descs {
            if desc.width < 0 || desc.height < 0 {
                return NvrResult::InvalidParameter;
            }
            bound.push(TextureDesc::new(
                TextureHandle(desc.texture as usize),
                desc.width as u32,
                desc.height as u32,
            ));
        }

        let Some(renderer) = state::current() else {
            return NvrResult::UnknownObject;
        };
        result_code(renderer.set_textures(StreamId(handle), kind, &bound))
    })
}

/// Unregister the frame callback and stop rendering. No frame of the
/// stream is stored or uploaded once this returns.
///
/// # Safety
/// Safe to call with any handle.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_disable_remote_video(handle: NvrStreamHandle) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(renderer) = state::current() else {
            return NvrResult::UnknownObject;
        };
        result_code(renderer.disable_stream(StreamId(handle)))
    })
}

extern "C" fn video_update() {
    guard((), || {
        let Some(renderer) = state::current() else {
            return;
        };
        match renderer.render_tick() {
            Ok(_) => {}
            Err(RendererError::NotInitialized) => log::trace!("video update before device init"),
            Err(err) => log::warn!("video update failed: {}", err),
        }
    })
}

/// The per-frame update method the host calls on its render thread
#[no_mangle]
pub extern "C" fn nvr_renderer_get_video_update_method() -> NvrVideoUpdateMethod {
    video_update
}

/// Set (or clear, with null) the size-changed callback
///
/// # Safety
/// `callback` must stay valid until replaced and accept calls from any thread.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_set_texture_size_changed(
    callback: Option<NvrTextureSizeChangedCallback>,
) {
    guard((), || {
        let renderer = match state::renderer() {
            Ok(renderer) => renderer,
            Err(err) => {
                log::error!("renderer unavailable: {}", err);
                return;
            }
        };
        let callback = callback.map(|callback| -> nvr_renderer::SizeChangedCallback {
            Arc::new(move |width: u32, height: u32, id: StreamId| {
                let Some(track) = BINDINGS.lock().track(id) else {
                    return;
                };
                let clamp = |v: u32| v.min(i32::MAX as u32) as i32;
                unsafe { callback(clamp(width), clamp(height), track) };
            })
        });
        renderer.set_size_changed_callback(callback);
    })
}

/// Copy a stream's counters into `out`
///
/// # Safety
/// `out` must be null or point to writable memory for an `NvrStreamStats`.
#[no_mangle]
pub unsafe extern "C" fn nvr_renderer_get_stats(
    handle: NvrStreamHandle,
    out: *mut NvrStreamStats,
) -> NvrResult {
    guard(NvrResult::InvalidState, || {
        let Some(out) = (unsafe { out.as_mut() }) else {
            return NvrResult::InvalidParameter;
        };
        let stats = state::current().and_then(|renderer| renderer.stream_stats(StreamId(handle)));
        match stats {
            Some(stats) => {
                *out = stats.into();
                NvrResult::Success
            }
            None => {
                *out = NvrStreamStats::zeroed();
                NvrResult::UnknownObject
            }
        }
    })
}
