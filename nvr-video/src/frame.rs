//! CPU-side frame containers
//!
//! [`FrameView`] borrows a decoded frame for the duration of a media engine
//! callback. [`FrameDesc`] owns a copy of its planes, and [`FrameObject`]
//! wraps a `FrameDesc` with the bookkeeping [`crate::FramePool`] needs.

use crate::error::FrameError;
use crate::types::{VideoKind, VideoRect, MAX_PLANES};

/// Borrowed view of a decoded frame. Valid only while the producer's
/// callback runs; it must be copied, never retained.
#[derive(Debug, Clone, Copy)]
pub struct FrameView<'a> {
    pub kind: VideoKind,
    pub width: u32,
    pub height: u32,
    pub planes: [Option<&'a [u8]>; MAX_PLANES],
    pub strides: [u32; MAX_PLANES],
    /// Damaged regions in plane 0 coordinates. Empty means the whole frame.
    pub dirty_rects: &'a [VideoRect],
}

impl<'a> FrameView<'a> {
    /// Planar 4:2:0 frame with an optional alpha plane
    pub fn i420(
        width: u32,
        height: u32,
        planes: [&'a [u8]; 3],
        strides: [u32; 3],
        alpha: Option<(&'a [u8], u32)>,
    ) -> Self {
        let (a_plane, a_stride) = match alpha {
            Some((plane, stride)) => (Some(plane), stride),
            None => (None, 0),
        };
        Self {
            kind: VideoKind::I420,
            width,
            height,
            planes: [Some(planes[0]), Some(planes[1]), Some(planes[2]), a_plane],
            strides: [strides[0], strides[1], strides[2], a_stride],
            dirty_rects: &[],
        }
    }

    /// Packed 32-bit frame
    pub fn argb(width: u32, height: u32, data: &'a [u8], stride: u32) -> Self {
        Self {
            kind: VideoKind::Argb,
            width,
            height,
            planes: [Some(data), None, None, None],
            strides: [stride, 0, 0, 0],
            dirty_rects: &[],
        }
    }

    pub fn with_dirty_rects(mut self, rects: &'a [VideoRect]) -> Self {
        self.dirty_rects = rects;
        self
    }

    /// Bytes of actual pixel data in one row of plane `index`
    pub fn row_bytes(&self, index: usize) -> usize {
        let (width, _) = self.kind.plane_size(index, self.width, self.height);
        width as usize * self.kind.plane_format().bytes_per_pixel() as usize
    }

    /// Bytes that must be readable for plane `index`
    fn plane_span(&self, index: usize) -> usize {
        let (_, rows) = self.kind.plane_size(index, self.width, self.height);
        if rows == 0 {
            return 0;
        }
        self.strides[index] as usize * (rows as usize - 1) + self.row_bytes(index)
    }

    /// Check every required plane is present and large enough
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.kind == VideoKind::None {
            return Err(FrameError::UnknownKind);
        }
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::EmptyFrame {
                width: self.width,
                height: self.height,
            });
        }

        for index in 0..self.kind.required_planes() {
            if self.planes[index].is_none() {
                return Err(FrameError::MissingPlane(index));
            }
        }

        for (index, plane) in self.planes.iter().enumerate() {
            let Some(plane) = plane else { continue };
            let row_bytes = self.row_bytes(index);
            if (self.strides[index] as usize) < row_bytes {
                return Err(FrameError::StrideTooSmall {
                    plane: index,
                    stride: self.strides[index],
                    row_bytes,
                });
            }
            let needed = self.plane_span(index);
            if plane.len() < needed {
                return Err(FrameError::PlaneTooShort {
                    plane: index,
                    len: plane.len(),
                    needed,
                });
            }
        }

        Ok(())
    }
}

/// Owned copy of one frame's planes
#[derive(Debug, Default)]
pub struct FrameDesc {
    kind: VideoKind,
    width: u32,
    height: u32,
    strides: [u32; MAX_PLANES],
    buffers: [Vec<u8>; MAX_PLANES],
    plane_count: usize,
    dirty_rects: Vec<VideoRect>,
}

impl FrameDesc {
    pub fn kind(&self) -> VideoKind {
        self.kind
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn plane_count(&self) -> usize {
        self.plane_count
    }

    pub fn stride(&self, index: usize) -> u32 {
        self.strides.get(index).copied().unwrap_or(0)
    }

    pub fn plane(&self, index: usize) -> Option<&[u8]> {
        if index >= self.plane_count {
            return None;
        }
        let buffer = &self.buffers[index];
        (!buffer.is_empty()).then_some(buffer.as_slice())
    }

    /// Dimensions of plane `index` in texels
    pub fn plane_size(&self, index: usize) -> (u32, u32) {
        self.kind.plane_size(index, self.width, self.height)
    }

    pub fn dirty_rects(&self) -> &[VideoRect] {
        &self.dirty_rects
    }

    /// Copy `view` into this frame, growing buffers only when needed.
    ///
    /// The view is validated first; on error the previous contents are
    /// left in an unspecified but memory-safe state.
    pub fn copy_from(&mut self, view: &FrameView<'_>) -> Result<(), FrameError> {
        view.validate()?;

        self.kind = view.kind;
        self.width = view.width;
        self.height = view.height;
        self.plane_count = 0;

        for index in 0..MAX_PLANES {
            let buffer = &mut self.buffers[index];
            buffer.clear();
            self.strides[index] = 0;

            let Some(src) = view.planes[index] else {
                continue;
            };
            let span = view.plane_span(index);
            buffer
                .try_reserve(span)
                .map_err(|_| FrameError::OutOfMemory(index))?;
            buffer.extend_from_slice(&src[..span]);
            self.strides[index] = view.strides[index];
            self.plane_count = index + 1;
        }

        self.dirty_rects.clear();
        self.dirty_rects.extend_from_slice(view.dirty_rects);
        Ok(())
    }

    /// Total bytes held by the plane buffers
    pub fn capacity(&self) -> usize {
        self.buffers.iter().map(Vec::capacity).sum()
    }

    pub(crate) fn clear_damage(&mut self) {
        self.dirty_rects.clear();
    }
}

/// Ownership stage of a [`FrameObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Sitting in the pool's free-list
    Free,
    /// Handed out by the pool, being filled by a producer
    Acquired,
    /// Published in a stream's pending slot
    Pending,
    /// Taken by the render tick for upload
    InFlight,
}

/// Reusable frame buffer owned by exactly one party at a time.
///
/// Neither `Clone` nor `Copy`; ownership moves from the pool to a pending
/// slot to the render tick and back.
#[derive(Debug)]
pub struct FrameObject {
    desc: FrameDesc,
    serial: u64,
    pool_id: u64,
    state: FrameState,
}

impl FrameObject {
    pub(crate) fn new(serial: u64, pool_id: u64) -> Self {
        Self {
            desc: FrameDesc::default(),
            serial,
            pool_id,
            state: FrameState::Acquired,
        }
    }

    /// Pool-unique identity, stable across recycling
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    pub fn desc(&self) -> &FrameDesc {
        &self.desc
    }

    pub fn copy_from(&mut self, view: &FrameView<'_>) -> Result<(), FrameError> {
        self.desc.copy_from(view)
    }

    /// Acquired -> Pending, performed when a dispatcher publishes the frame
    pub fn mark_pending(&mut self) {
        debug_assert_eq!(self.state, FrameState::Acquired, "frame {}", self.serial);
        self.state = FrameState::Pending;
    }

    /// Pending -> InFlight, performed when the render tick takes the frame
    pub fn mark_in_flight(&mut self) {
        debug_assert_eq!(self.state, FrameState::Pending, "frame {}", self.serial);
        self.state = FrameState::InFlight;
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn set_state(&mut self, state: FrameState) {
        self.state = state;
    }

    pub(crate) fn desc_mut(&mut self) -> &mut FrameDesc {
        &mut self.desc
    }
}
