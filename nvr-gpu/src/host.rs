//! CPU-memory backend
//!
//! Staging resources and destination textures live in host memory. Every
//! device copy is recorded so callers can inspect what a tick uploaded.
//! Clones share one device, which lets a caller keep a handle after
//! boxing the backend into the renderer.

use crate::backend::{copy_regions, DeviceEvent, RenderBackend, StagingId, WriteFn};
use crate::error::BackendError;
use nvr_video::{PixelFormat, StagingDesc, TextureDesc, TextureHandle, VideoRect};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Row pitch alignment of host staging memory, matching common GPU
/// upload-buffer requirements
pub const ROW_PITCH_ALIGNMENT: usize = 256;

pub fn aligned_pitch(row_bytes: usize) -> usize {
    row_bytes.div_ceil(ROW_PITCH_ALIGNMENT).max(1) * ROW_PITCH_ALIGNMENT
}

struct HostStaging {
    desc: StagingDesc,
    row_pitch: usize,
    data: Vec<u8>,
}

/// Destination texture with tightly packed rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTexture {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl HostTexture {
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel() as usize
    }

    pub fn row(&self, y: u32) -> &[u8] {
        let row_bytes = self.row_bytes();
        let start = y as usize * row_bytes;
        &self.data[start..start + row_bytes]
    }
}

/// One device copy issued by [`RenderBackend::copy_to_texture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRecord {
    pub staging: StagingId,
    pub texture: TextureHandle,
    pub region: VideoRect,
}

#[derive(Default)]
struct HostDevice {
    next_staging: u64,
    next_texture: usize,
    staging: HashMap<StagingId, HostStaging>,
    textures: HashMap<TextureHandle, HostTexture>,
    copies: Vec<CopyRecord>,
    events: Vec<DeviceEvent>,
    maps: u64,

    fail_creates: bool,
    fail_maps: bool,
    fail_copies: bool,
    fail_copies_to: Option<TextureHandle>,
}

#[derive(Clone, Default)]
pub struct HostBackend {
    device: Arc<Mutex<HostDevice>>,
}

impl HostBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a zeroed destination texture
    pub fn create_texture(&self, format: PixelFormat, width: u32, height: u32) -> TextureHandle {
        let mut device = self.device.lock();
        device.next_texture += 1;
        let handle = TextureHandle(device.next_texture);
        let len = width as usize * height as usize * format.bytes_per_pixel() as usize;
        device.textures.insert(
            handle,
            HostTexture {
                format,
                width,
                height,
                data: vec![0; len],
            },
        );
        handle
    }

    /// Snapshot of a texture's contents
    pub fn texture(&self, handle: TextureHandle) -> Option<HostTexture> {
        self.device.lock().textures.get(&handle).cloned()
    }

    pub fn destroy_texture(&self, handle: TextureHandle) -> bool {
        self.device.lock().textures.remove(&handle).is_some()
    }

    pub fn copies(&self) -> Vec<CopyRecord> {
        self.device.lock().copies.clone()
    }

    /// Drain the copy log
    pub fn take_copies(&self) -> Vec<CopyRecord> {
        std::mem::take(&mut self.device.lock().copies)
    }

    pub fn events(&self) -> Vec<DeviceEvent> {
        self.device.lock().events.clone()
    }

    /// Staging resources currently alive on the device
    pub fn staging_count(&self) -> usize {
        self.device.lock().staging.len()
    }

    pub fn map_count(&self) -> u64 {
        self.device.lock().maps
    }

    pub fn set_fail_creates(&self, fail: bool) {
        self.device.lock().fail_creates = fail;
    }

    pub fn set_fail_maps(&self, fail: bool) {
        self.device.lock().fail_maps = fail;
    }

    pub fn set_fail_copies(&self, fail: bool) {
        self.device.lock().fail_copies = fail;
    }

    /// Fail device copies into `texture` only. Destination checks still
    /// pass, so the failure surfaces in the middle of an upload.
    pub fn set_fail_copies_to(&self, texture: Option<TextureHandle>) {
        self.device.lock().fail_copies_to = texture;
    }
}

fn check_destination(
    desc: &StagingDesc,
    dst: &TextureDesc,
    texture: &HostTexture,
) -> Result<(), BackendError> {
    if (texture.width, texture.height) != (dst.width, dst.height) {
        return Err(BackendError::SizeMismatch {
            staging: (dst.width, dst.height),
            texture: (texture.width, texture.height),
        });
    }
    if texture.format != desc.format {
        return Err(BackendError::CopyFailed(format!(
            "texture format {:?} does not match staging format {:?}",
            texture.format, desc.format
        )));
    }
    copy_regions(desc, dst, &[]).map(|_| ())
}

impl RenderBackend for HostBackend {
    fn name(&self) -> &'static str {
        "host"
    }

    fn on_device_event(&mut self, event: DeviceEvent) -> Result<(), BackendError> {
        self.device.lock().events.push(event);
        Ok(())
    }

    fn create_staging(&mut self, desc: &StagingDesc) -> Result<StagingId, BackendError> {
        let mut device = self.device.lock();
        if device.fail_creates {
            return Err(BackendError::CreateFailed {
                desc: *desc,
                reason: "creation failure injected".into(),
            });
        }

        let row_pitch = aligned_pitch(desc.row_bytes());
        let mut data = Vec::new();
        data.try_reserve_exact(row_pitch * desc.height as usize)
            .map_err(|err| BackendError::CreateFailed {
                desc: *desc,
                reason: err.to_string(),
            })?;
        data.resize(row_pitch * desc.height as usize, 0);

        device.next_staging += 1;
        let id = StagingId(device.next_staging);
        device.staging.insert(
            id,
            HostStaging {
                desc: *desc,
                row_pitch,
                data,
            },
        );
        Ok(id)
    }

    fn destroy_staging(&mut self, id: StagingId) {
        if self.device.lock().staging.remove(&id).is_none() {
            log::warn!("host: destroy of unknown staging {:?}", id);
        }
    }

    fn map_write(&mut self, id: StagingId, write: &mut WriteFn<'_>) -> Result<(), BackendError> {
        let mut device = self.device.lock();
        if device.fail_maps {
            return Err(BackendError::MapFailed(id));
        }
        let staging = device
            .staging
            .get_mut(&id)
            .ok_or(BackendError::UnknownStaging(id))?;

        write(&mut staging.data, staging.row_pitch);
        device.maps += 1;
        Ok(())
    }

    fn validate_destination(
        &self,
        desc: &StagingDesc,
        dst: &TextureDesc,
    ) -> Result<(), BackendError> {
        let device = self.device.lock();
        let texture = device
            .textures
            .get(&dst.texture)
            .ok_or(BackendError::UnknownTexture(dst.texture))?;
        check_destination(desc, dst, texture)
    }

    fn copy_to_texture(
        &mut self,
        id: StagingId,
        desc: &StagingDesc,
        dst: &TextureDesc,
        rects: &[VideoRect],
    ) -> Result<usize, BackendError> {
        let mut guard = self.device.lock();
        let device = &mut *guard;
        if device.fail_copies || device.fail_copies_to == Some(dst.texture) {
            return Err(BackendError::CopyFailed("copy failure injected".into()));
        }

        let staging = device
            .staging
            .get(&id)
            .ok_or(BackendError::UnknownStaging(id))?;
        debug_assert_eq!(&staging.desc, desc);
        let texture = device
            .textures
            .get_mut(&dst.texture)
            .ok_or(BackendError::UnknownTexture(dst.texture))?;
        check_destination(&staging.desc, dst, texture)?;

        let bpp = staging.desc.format.bytes_per_pixel() as usize;
        let dst_pitch = texture.row_bytes();
        let mut copied = 0;

        for region in copy_regions(&staging.desc, dst, rects)? {
            let x = region.x as usize * bpp;
            let len = region.width as usize * bpp;

            for y in region.y as usize..region.bottom() as usize {
                let src_at = y * staging.row_pitch + x;
                let dst_at = y * dst_pitch + x;
                let (Some(src), Some(out)) = (
                    staging.data.get(src_at..src_at + len),
                    texture.data.get_mut(dst_at..dst_at + len),
                ) else {
                    return Err(BackendError::CopyFailed(format!(
                        "region {:?} out of range",
                        region
                    )));
                };
                out.copy_from_slice(src);
            }

            device.copies.push(CopyRecord {
                staging: id,
                texture: dst.texture,
                region,
            });
            copied += 1;
        }

        Ok(copied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(
        backend: &mut HostBackend,
        id: StagingId,
        desc: &StagingDesc,
        value: impl Fn(usize, usize) -> u8,
    ) {
        let row_bytes = desc.row_bytes();
        let rows = desc.height as usize;
        backend
            .map_write(id, &mut |data, pitch| {
                for y in 0..rows {
                    for x in 0..row_bytes {
                        data[y * pitch + x] = value(x, y);
                    }
                }
            })
            .unwrap();
    }

    #[test]
    fn test_pitch_alignment() {
        assert_eq!(aligned_pitch(1), 256);
        assert_eq!(aligned_pitch(256), 256);
        assert_eq!(aligned_pitch(1920), 2048);
        assert_eq!(aligned_pitch(0), 256);
    }

    #[test]
    fn test_whole_copy() {
        let mut backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::R8, 300, 4);
        let texture = backend.create_texture(PixelFormat::R8, 300, 4);
        let id = backend.create_staging(&desc).unwrap();

        fill(&mut backend, id, &desc, |x, y| (x + y) as u8);
        let dst = TextureDesc::new(texture, 300, 4);
        assert_eq!(backend.copy_to_texture(id, &desc, &dst, &[]).unwrap(), 1);

        let tex = backend.texture(texture).unwrap();
        assert_eq!(tex.row(3)[299], (299 + 3) as u8);
        assert_eq!(
            backend.copies(),
            vec![CopyRecord {
                staging: id,
                texture,
                region: VideoRect::new(0, 0, 300, 4)
            }]
        );
    }

    #[test]
    fn test_partial_copy_leaves_other_texels() {
        let mut backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::Bgra8, 8, 8);
        let texture = backend.create_texture(PixelFormat::Bgra8, 8, 8);
        let id = backend.create_staging(&desc).unwrap();

        fill(&mut backend, id, &desc, |_, _| 0xAB);
        let dst = TextureDesc::new(texture, 8, 8);
        let rects = [VideoRect::new(2, 2, 2, 2), VideoRect::new(6, 6, 4, 4)];
        assert_eq!(backend.copy_to_texture(id, &desc, &dst, &rects).unwrap(), 1);

        let tex = backend.texture(texture).unwrap();
        assert_eq!(&tex.row(2)[8..16], &[0xAB; 8]);
        assert_eq!(&tex.row(2)[0..8], &[0; 8]);
        assert_eq!(tex.row(5), &[0; 32]);
    }

    #[test]
    fn test_copy_checks() {
        let mut backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::R8, 16, 16);
        let id = backend.create_staging(&desc).unwrap();

        let missing = TextureDesc::new(TextureHandle(99), 16, 16);
        assert_eq!(
            backend.copy_to_texture(id, &desc, &missing, &[]),
            Err(BackendError::UnknownTexture(TextureHandle(99)))
        );

        let small = backend.create_texture(PixelFormat::R8, 8, 8);
        let claimed = TextureDesc::new(small, 16, 16);
        assert!(matches!(
            backend.copy_to_texture(id, &desc, &claimed, &[]),
            Err(BackendError::SizeMismatch { .. })
        ));

        let rgba = backend.create_texture(PixelFormat::Bgra8, 16, 16);
        assert!(matches!(
            backend.copy_to_texture(id, &desc, &TextureDesc::new(rgba, 16, 16), &[]),
            Err(BackendError::CopyFailed(_))
        ));
        assert!(backend.copies().is_empty());
    }

    #[test]
    fn test_validate_destination_matches_copy_checks() {
        let backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::R8, 16, 16);

        let good = backend.create_texture(PixelFormat::R8, 16, 16);
        assert!(backend
            .validate_destination(&desc, &TextureDesc::new(good, 16, 16))
            .is_ok());

        assert!(backend.destroy_texture(good));
        assert_eq!(
            backend.validate_destination(&desc, &TextureDesc::new(good, 16, 16)),
            Err(BackendError::UnknownTexture(good))
        );

        let rgba = backend.create_texture(PixelFormat::Bgra8, 16, 16);
        assert!(backend
            .validate_destination(&desc, &TextureDesc::new(rgba, 16, 16))
            .is_err());
        assert!(backend.copies().is_empty());
    }

    #[test]
    fn test_copy_failure_for_one_texture() {
        let mut backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::R8, 4, 4);
        let id = backend.create_staging(&desc).unwrap();
        let a = backend.create_texture(PixelFormat::R8, 4, 4);
        let b = backend.create_texture(PixelFormat::R8, 4, 4);
        backend.set_fail_copies_to(Some(b));

        let dst_b = TextureDesc::new(b, 4, 4);
        assert!(backend.validate_destination(&desc, &dst_b).is_ok());
        assert!(backend.copy_to_texture(id, &desc, &dst_b, &[]).is_err());
        assert_eq!(
            backend.copy_to_texture(id, &desc, &TextureDesc::new(a, 4, 4), &[]),
            Ok(1)
        );
    }

    #[test]
    fn test_failure_injection() {
        let mut backend = HostBackend::new();
        let desc = StagingDesc::new(PixelFormat::R8, 4, 4);

        backend.set_fail_creates(true);
        assert!(backend.create_staging(&desc).is_err());
        backend.set_fail_creates(false);

        let id = backend.create_staging(&desc).unwrap();
        backend.set_fail_maps(true);
        assert_eq!(
            backend.map_write(id, &mut |_, _| {}),
            Err(BackendError::MapFailed(id))
        );
        assert_eq!(backend.map_count(), 0);
    }

    #[test]
    fn test_clones_share_device() {
        let backend = HostBackend::new();
        let mut boxed: Box<dyn RenderBackend> = Box::new(backend.clone());

        let id = boxed
            .create_staging(&StagingDesc::new(PixelFormat::R8, 4, 4))
            .unwrap();
        assert_eq!(backend.staging_count(), 1);

        boxed.destroy_staging(id);
        boxed.on_device_event(DeviceEvent::Shutdown).unwrap();
        assert_eq!(backend.staging_count(), 0);
        assert_eq!(backend.events(), vec![DeviceEvent::Shutdown]);
    }
}
