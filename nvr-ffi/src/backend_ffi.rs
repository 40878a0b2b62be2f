//! Host-supplied graphics backend
//!
//! Lets a native D3D/GL/Metal implementation drive the render tick through
//! a table of C function pointers.

use bytemuck::{Pod, Zeroable};
use libc::c_void;
use nvr_gpu::{copy_regions, BackendError, DeviceEvent, RenderBackend, StagingId, WriteFn};
use nvr_video::{StagingDesc, TextureDesc, VideoRect};
use std::ptr;

/// C mirror of a copy region
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct NvrRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

pub type NvrDeviceEventFn = unsafe extern "C" fn(context: *mut c_void, event: i32) -> i32;
pub type NvrCreateStagingFn = unsafe extern "C" fn(
    context: *mut c_void,
    format: u32,
    width: u32,
    height: u32,
    out_id: *mut u64,
) -> i32;
pub type NvrDestroyStagingFn = unsafe extern "C" fn(context: *mut c_void, id: u64);
pub type NvrBeginWriteFn = unsafe extern "C" fn(
    context: *mut c_void,
    id: u64,
    out_data: *mut *mut u8,
    out_len: *mut usize,
    out_row_pitch: *mut usize,
) -> i32;
pub type NvrEndWriteFn = unsafe extern "C" fn(context: *mut c_void, id: u64);
pub type NvrCopyToTextureFn = unsafe extern "C" fn(
    context: *mut c_void,
    id: u64,
    texture: *mut c_void,
    rects: *const NvrRect,
    rect_count: u32,
) -> i32;

/// Graphics backend implemented by the host.
///
/// Every function returning `i32` reports success with 0. All calls are made
/// on the render thread with `context` passed through unchanged.
/// `on_device_event` is optional; the others are required.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NvrBackendVtable {
    pub context: *mut c_void,
    pub on_device_event: Option<NvrDeviceEventFn>,
    pub create_staging: Option<NvrCreateStagingFn>,
    pub destroy_staging: Option<NvrDestroyStagingFn>,
    pub begin_write: Option<NvrBeginWriteFn>,
    pub end_write: Option<NvrEndWriteFn>,
    pub copy_to_texture: Option<NvrCopyToTextureFn>,
}

// SAFETY: the host guarantees `context` may be used from the render thread,
// which is the only thread the vtable is ever called from.
unsafe impl Send for NvrBackendVtable {}

pub(crate) struct ForeignBackend {
    context: *mut c_void,
    on_device_event: Option<NvrDeviceEventFn>,
    create_staging: NvrCreateStagingFn,
    destroy_staging: NvrDestroyStagingFn,
    begin_write: NvrBeginWriteFn,
    end_write: NvrEndWriteFn,
    copy_to_texture: NvrCopyToTextureFn,
}

// SAFETY: see NvrBackendVtable
unsafe impl Send for ForeignBackend {}

impl ForeignBackend {
    /// `None` if a required entry is missing
    pub(crate) fn new(vtable: &NvrBackendVtable) -> Option<Self> {
        Some(Self {
            context: vtable.context,
            on_device_event: vtable.on_device_event,
            create_staging: vtable.create_staging?,
            destroy_staging: vtable.destroy_staging?,
            begin_write: vtable.begin_write?,
            end_write: vtable.end_write?,
            copy_to_texture: vtable.copy_to_texture?,
        })
    }
}

impl RenderBackend for ForeignBackend {
    fn name(&self) -> &'static str {
        "foreign"
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> Result<(), BackendError> {
        let Some(notify) = self.on_device_event else {
            return Ok(());
        };
        match unsafe { notify(self.context, event as i32) } {
            0 => Ok(()),
            code => {
                log::warn!("foreign backend rejected {:?} with code {}", event, code);
                Err(BackendError::DeviceNotReady)
            }
        }
    }

    fn create_staging(&mut self, desc: &StagingDesc) -> Result<StagingId, BackendError> {
        let mut id = 0u64;
        let format = desc.format as u32;
        let code = unsafe {
            (self.create_staging)(self.context, format, desc.width, desc.height, &mut id)
        };
        if code != 0 {
            return Err(BackendError::CreateFailed {
                desc: *desc,
                reason: format!("host returned {}", code),
            });
        }
        Ok(StagingId(id))
    }

    fn destroy_staging(&mut self, id: StagingId) {
        unsafe { (self.destroy_staging)(self.context, id.0) }
    }

    fn map_write(&mut self, id: StagingId, write: &mut WriteFn<'_>) -> Result<(), BackendError> {
        let mut data: *mut u8 = ptr::null_mut();
        let mut len = 0usize;
        let mut row_pitch = 0usize;
        let code = unsafe {
            (self.begin_write)(self.context, id.0, &mut data, &mut len, &mut row_pitch)
        };
        if code != 0 {
            return Err(BackendError::MapFailed(id));
        }

        if !data.is_null() && len > 0 {
            let mapped = unsafe { std::slice::from_raw_parts_mut(data, len) };
            write(mapped, row_pitch);
        }
        unsafe { (self.end_write)(self.context, id.0) };

        if data.is_null() {
            return Err(BackendError::MapFailed(id));
        }
        Ok(())
    }

    fn copy_to_texture(
        &mut self,
        id: StagingId,
        desc: &StagingDesc,
        dst: &TextureDesc,
        rects: &[VideoRect],
    ) -> Result<usize, BackendError> {
        let regions: Vec<VideoRect> = copy_regions(desc, dst, rects)?.collect();
        if regions.is_empty() {
            return Ok(0);
        }

        let c_regions: &[NvrRect] = bytemuck::cast_slice(&regions);
        let code = unsafe {
            (self.copy_to_texture)(
                self.context,
                id.0,
                dst.texture.0 as *mut c_void,
                c_regions.as_ptr(),
                c_regions.len() as u32,
            )
        };
        if code != 0 {
            return Err(BackendError::CopyFailed(format!("host returned {}", code)));
        }
        Ok(regions.len())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use nvr_video::{PixelFormat, TextureHandle};
    use parking_lot::Mutex;

    /// CPU device behind a C vtable
    #[derive(Default)]
    pub(crate) struct TestDevice {
        pub buffers: Vec<Vec<u8>>,
        pub pitches: Vec<usize>,
        pub mapped: Option<u64>,
        pub copies: Vec<(u64, usize, Vec<NvrRect>)>,
        pub events: Vec<i32>,
        pub fail_create: bool,
    }

    unsafe extern "C" fn on_event(context: *mut c_void, event: i32) -> i32 {
        let device = &*(context as *const Mutex<TestDevice>);
        device.lock().events.push(event);
        0
    }

    unsafe extern "C" fn create(
        context: *mut c_void,
        format: u32,
        width: u32,
        height: u32,
        out_id: *mut u64,
    ) -> i32 {
        let device = &*(context as *const Mutex<TestDevice>);
        let mut device = device.lock();
        if device.fail_create {
            return -1;
        }
        let bpp = PixelFormat::from_raw(format).unwrap().bytes_per_pixel();
        let pitch = width as usize * bpp as usize;
        device.buffers.push(vec![0; pitch * height as usize]);
        device.pitches.push(pitch);
        *out_id = device.buffers.len() as u64;
        0
    }

    unsafe extern "C" fn destroy(_context: *mut c_void, _id: u64) {}

    unsafe extern "C" fn begin(
        context: *mut c_void,
        id: u64,
        out_data: *mut *mut u8,
        out_len: *mut usize,
        out_row_pitch: *mut usize,
    ) -> i32 {
        let device = &*(context as *const Mutex<TestDevice>);
        let mut device = device.lock();
        assert!(device.mapped.is_none(), "nested mapping");
        let index = id as usize - 1;
        *out_row_pitch = device.pitches[index];
        let buffer = &mut device.buffers[index];
        *out_data = buffer.as_mut_ptr();
        *out_len = buffer.len();
        device.mapped = Some(id);
        0
    }

    unsafe extern "C" fn end(context: *mut c_void, id: u64) {
        let device = &*(context as *const Mutex<TestDevice>);
        let mut device = device.lock();
        assert_eq!(device.mapped.take(), Some(id));
    }

    unsafe extern "C" fn copy(
        context: *mut c_void,
        id: u64,
        texture: *mut c_void,
        rects: *const NvrRect,
        rect_count: u32,
    ) -> i32 {
        let device = &*(context as *const Mutex<TestDevice>);
        let rects = std::slice::from_raw_parts(rects, rect_count as usize).to_vec();
        device.lock().copies.push((id, texture as usize, rects));
        0
    }

    pub(crate) fn vtable(device: &'static Mutex<TestDevice>) -> NvrBackendVtable {
        NvrBackendVtable {
            context: device as *const Mutex<TestDevice> as *mut c_void,
            on_device_event: Some(on_event),
            create_staging: Some(create),
            destroy_staging: Some(destroy),
            begin_write: Some(begin),
            end_write: Some(end),
            copy_to_texture: Some(copy),
        }
    }

    fn leak_device() -> &'static Mutex<TestDevice> {
        Box::leak(Box::new(Mutex::new(TestDevice::default())))
    }

    #[test]
    fn test_missing_entry_rejected() {
        let mut table = vtable(leak_device());
        table.end_write = None;
        assert!(ForeignBackend::new(&table).is_none());
    }

    #[test]
    fn test_map_write_brackets_the_writer() {
        let device = leak_device();
        let mut backend = ForeignBackend::new(&vtable(device)).unwrap();
        let desc = StagingDesc::new(PixelFormat::R8, 4, 2);
        let id = backend.create_staging(&desc).unwrap();

        backend
            .map_write(id, &mut |data: &mut [u8], pitch: usize| {
                assert_eq!(pitch, 4);
                data.fill(7);
            })
            .unwrap();

        let device = device.lock();
        assert!(device.mapped.is_none());
        assert_eq!(device.buffers[0], vec![7; 8]);
    }

    #[test]
    fn test_copy_passes_regions() {
        let device = leak_device();
        let mut backend = ForeignBackend::new(&vtable(device)).unwrap();
        let desc = StagingDesc::new(PixelFormat::Bgra8, 8, 8);
        let id = backend.create_staging(&desc).unwrap();
        let dst = TextureDesc::new(TextureHandle(0x40), 8, 8);

        let rects = [VideoRect::new(1, 1, 2, 2), VideoRect::new(6, 6, 4, 4)];
        assert_eq!(backend.copy_to_texture(id, &desc, &dst, &rects).unwrap(), 1);

        let device = device.lock();
        let (staging, texture, regions) = &device.copies[0];
        assert_eq!((*staging, *texture), (id.0, 0x40));
        assert_eq!(regions, &vec![NvrRect { x: 1, y: 1, width: 2, height: 2 }]);
    }

    #[test]
    fn test_create_failure_reported() {
        let device = leak_device();
        device.lock().fail_create = true;
        let mut backend = ForeignBackend::new(&vtable(device)).unwrap();

        let err = backend
            .create_staging(&StagingDesc::new(PixelFormat::R8, 2, 2))
            .unwrap_err();
        assert!(matches!(err, BackendError::CreateFailed { .. }));
    }

    #[test]
    fn test_device_events_forwarded() {
        let device = leak_device();
        let mut backend = ForeignBackend::new(&vtable(device)).unwrap();
        backend.on_device_event(DeviceEvent::Initialize).unwrap();
        backend.on_device_event(DeviceEvent::Shutdown).unwrap();
        assert_eq!(device.lock().events, vec![0, 1]);
    }
}
