//! Graphics capability interface
//!
//! One implementation per native graphics API, selected once when the
//! host's device initializes. Staging resources are referred to by
//! [`StagingId`]; the backend owns the actual GPU objects.

use crate::error::BackendError;
use nvr_video::{StagingDesc, TextureDesc, VideoRect};

/// Backend-assigned identity of a staging resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StagingId(pub u64);

/// Host device lifecycle notifications
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceEvent {
    Initialize = 0,
    Shutdown = 1,
    BeforeReset = 2,
    AfterReset = 3,
}

impl DeviceEvent {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(DeviceEvent::Initialize),
            1 => Some(DeviceEvent::Shutdown),
            2 => Some(DeviceEvent::BeforeReset),
            3 => Some(DeviceEvent::AfterReset),
            _ => None,
        }
    }
}

/// Callback receiving mapped staging memory and its row pitch in bytes
pub type WriteFn<'a> = dyn FnMut(&mut [u8], usize) + 'a;

/// Operations the render tick needs from a graphics API.
///
/// All calls happen on the render thread. Implementations must not call
/// back into the renderer.
pub trait RenderBackend: Send {
    /// Short name for logs
    fn name(&self) -> &'static str;

    fn on_device_event(&mut self, event: DeviceEvent) -> Result<(), BackendError> {
        let _ = event;
        Ok(())
    }

    /// Create a CPU-writable, GPU-readable resource sized for `desc`
    fn create_staging(&mut self, desc: &StagingDesc) -> Result<StagingId, BackendError>;

    fn destroy_staging(&mut self, id: StagingId);

    /// Map `id` for writing, hand the mapping to `write`, then unmap.
    ///
    /// This is the begin-write/end-write pair as one scoped call; the
    /// resource is never left mapped when this returns.
    fn map_write(&mut self, id: StagingId, write: &mut WriteFn<'_>) -> Result<(), BackendError>;

    /// Check that a copy from a staging resource shaped like `desc` into
    /// `dst` would be accepted, without issuing it. The default only
    /// compares sizes.
    fn validate_destination(
        &self,
        desc: &StagingDesc,
        dst: &TextureDesc,
    ) -> Result<(), BackendError> {
        copy_regions(desc, dst, &[]).map(|_| ())
    }

    /// Issue the device-side copy from staging `id` into `dst`, restricted
    /// to `rects` (whole resource when empty). Returns the regions copied.
    fn copy_to_texture(
        &mut self,
        id: StagingId,
        desc: &StagingDesc,
        dst: &TextureDesc,
        rects: &[VideoRect],
    ) -> Result<usize, BackendError>;
}

/// Regions of a staging-to-texture copy that are safe to issue.
///
/// Staging and destination must have the same size. Regions outside the
/// bounds are skipped rather than clipped, since non-dirty texels may hold
/// stale data.
pub fn copy_regions<'a>(
    desc: &StagingDesc,
    dst: &TextureDesc,
    rects: &'a [VideoRect],
) -> Result<impl Iterator<Item = VideoRect> + 'a, BackendError> {
    if (desc.width, desc.height) != (dst.width, dst.height) {
        return Err(BackendError::SizeMismatch {
            staging: (desc.width, desc.height),
            texture: (dst.width, dst.height),
        });
    }

    let bounds = desc.bounds();
    let whole = rects.is_empty().then_some(bounds);
    Ok(whole.into_iter().chain(
        rects
            .iter()
            .copied()
            .filter(move |rect| rect.is_valid() && bounds.contains(rect)),
    ))
}
