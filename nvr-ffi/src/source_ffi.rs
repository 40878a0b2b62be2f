//! Media engine registration
//!
//! Frames arrive through two C trampolines whose `user_data` is the stream
//! id. The engine's register functions install or (with a null callback)
//! remove them for one track.

use crate::{guard, state};
use libc::c_void;
use nvr_renderer::{FrameSink, FrameSource, StreamId};
use nvr_video::{FrameView, VideoKind};

/// Opaque media engine track the renderer reads frames from
pub type NvrTrackHandle = *mut c_void;

/// Planar 4:2:0 frame with optional alpha, valid only during the callback.
/// U and V hold `ceil(height / 2)` rows.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvrI420AFrame {
    pub width: u32,
    pub height: u32,
    pub ydata: *const u8,
    pub udata: *const u8,
    pub vdata: *const u8,
    /// May be null
    pub adata: *const u8,
    pub ystride: i32,
    pub ustride: i32,
    pub vstride: i32,
    pub astride: i32,
}

/// Packed 32-bit frame (B first, A last), valid only during the callback
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvrArgb32Frame {
    pub width: u32,
    pub height: u32,
    pub argb32_data: *const u8,
    pub stride: i32,
}

pub type NvrI420AFrameCallback =
    unsafe extern "C" fn(user_data: *mut c_void, frame: *const NvrI420AFrame);
pub type NvrArgb32FrameCallback =
    unsafe extern "C" fn(user_data: *mut c_void, frame: *const NvrArgb32Frame);

pub type NvrRegisterI420AFn = unsafe extern "C" fn(
    track: NvrTrackHandle,
    callback: Option<NvrI420AFrameCallback>,
    user_data: *mut c_void,
);
pub type NvrRegisterArgb32Fn = unsafe extern "C" fn(
    track: NvrTrackHandle,
    callback: Option<NvrArgb32FrameCallback>,
    user_data: *mut c_void,
);

/// Media engine functions used to (un)register frame callbacks for a track
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct NvrFrameRegistration {
    pub register_i420a: Option<NvrRegisterI420AFn>,
    pub register_argb32: Option<NvrRegisterArgb32Fn>,
}

/// Borrow `rows` rows of a plane whose last row may end right after its
/// `row_bytes` of pixels. `None` for a null pointer or a non-positive stride.
unsafe fn plane<'a>(
    data: *const u8,
    stride: i32,
    rows: u32,
    row_bytes: usize,
) -> Option<(&'a [u8], u32)> {
    if data.is_null() || stride <= 0 {
        return None;
    }
    let len = match rows {
        0 => 0,
        rows => stride as usize * (rows as usize - 1) + row_bytes.min(stride as usize),
    };
    Some((std::slice::from_raw_parts(data, len), stride as u32))
}

impl NvrI420AFrame {
    /// # Safety
    /// Every non-null plane pointer must cover `stride * (rows - 1)` bytes
    /// plus one row of pixels.
    pub(crate) unsafe fn view(&self) -> Option<FrameView<'_>> {
        let luma = self.width as usize;
        let chroma = self.width.div_ceil(2) as usize;
        let chroma_rows = self.height.div_ceil(2);
        let (y, ys) = plane(self.ydata, self.ystride, self.height, luma)?;
        let (u, us) = plane(self.udata, self.ustride, chroma_rows, chroma)?;
        let (v, vs) = plane(self.vdata, self.vstride, chroma_rows, chroma)?;
        let alpha = plane(self.adata, self.astride, self.height, luma);
        Some(FrameView::i420(self.width, self.height, [y, u, v], [ys, us, vs], alpha))
    }
}

impl NvrArgb32Frame {
    /// # Safety
    /// `argb32_data` must cover `stride * (height - 1) + width * 4` bytes.
    pub(crate) unsafe fn view(&self) -> Option<FrameView<'_>> {
        let row_bytes = self.width as usize * 4;
        let (data, stride) = plane(self.argb32_data, self.stride, self.height, row_bytes)?;
        Some(FrameView::argb(self.width, self.height, data, stride))
    }
}

fn stream_from(user_data: *mut c_void) -> StreamId {
    StreamId(user_data as usize as u64)
}

fn deliver(id: StreamId, view: Option<FrameView<'_>>) {
    let Some(view) = view else {
        log::trace!("stream {}: frame with missing planes dropped", id);
        return;
    };
    // Frames arriving before the renderer exists have nowhere to go
    if let Some(renderer) = state::current() {
        renderer.submit_frame(id, &view);
    }
}

unsafe extern "C" fn i420a_frame_ready(user_data: *mut c_void, frame: *const NvrI420AFrame) {
    guard((), || {
        if let Some(frame) = unsafe { frame.as_ref() } {
            deliver(stream_from(user_data), unsafe { frame.view() });
        }
    })
}

unsafe extern "C" fn argb32_frame_ready(user_data: *mut c_void, frame: *const NvrArgb32Frame) {
    guard((), || {
        if let Some(frame) = unsafe { frame.as_ref() } {
            deliver(stream_from(user_data), unsafe { frame.view() });
        }
    })
}

/// [`FrameSource`] backed by a media engine track
pub(crate) struct ForeignFrameSource {
    track: NvrTrackHandle,
    registration: NvrFrameRegistration,
    installed: Option<VideoKind>,
}

// SAFETY: the track handle is only passed back to the media engine, whose
// register functions may be called from any thread.
unsafe impl Send for ForeignFrameSource {}

impl ForeignFrameSource {
    pub(crate) fn new(track: NvrTrackHandle, registration: NvrFrameRegistration) -> Self {
        Self {
            track,
            registration,
            installed: None,
        }
    }

    fn register(&self, kind: VideoKind, user_data: Option<StreamId>) -> bool {
        let data = user_data.map_or(std::ptr::null_mut(), |id| id.0 as usize as *mut c_void);
        match kind {
            VideoKind::I420 => match self.registration.register_i420a {
                Some(register) => {
                    let callback = user_data.map(|_| i420a_frame_ready as NvrI420AFrameCallback);
                    unsafe { register(self.track, callback, data) };
                    true
                }
                None => false,
            },
            VideoKind::Argb => match self.registration.register_argb32 {
                Some(register) => {
                    let callback =
                        user_data.map(|_| argb32_frame_ready as NvrArgb32FrameCallback);
                    unsafe { register(self.track, callback, data) };
                    true
                }
                None => false,
            },
            VideoKind::None => false,
        }
    }
}

impl FrameSource for ForeignFrameSource {
    fn install(&mut self, kind: VideoKind, sink: FrameSink) {
        if self.register(kind, Some(sink.stream_id())) {
            self.installed = Some(kind);
        } else {
            log::warn!(
                "stream {}: media engine has no {:?} frame registration",
                sink.stream_id(),
                kind
            );
        }
    }

    fn uninstall(&mut self) {
        if let Some(kind) = self.installed.take() {
            self.register(kind, None);
        }
    }
}

impl Drop for ForeignFrameSource {
    fn drop(&mut self) {
        self.uninstall();
    }
}
