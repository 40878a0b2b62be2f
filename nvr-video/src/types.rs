//! Video data types and constants

use bytemuck::{Pod, Zeroable};

/// Maximum number of planes a frame can carry (Y, U, V, A).
pub const MAX_PLANES: usize = 4;

/// Layout of the frames a stream delivers
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum VideoKind {
    #[default]
    None = 0,
    I420 = 1, // Planar YUV 4:2:0 with optional alpha plane
    Argb = 2, // Packed 32-bit, single plane
}

impl VideoKind {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(VideoKind::None),
            1 => Some(VideoKind::I420),
            2 => Some(VideoKind::Argb),
            _ => None,
        }
    }

    /// Planes that must be present for a frame of this kind to be accepted
    pub fn required_planes(self) -> usize {
        match self {
            VideoKind::None => 0,
            VideoKind::I420 => 3,
            VideoKind::Argb => 1,
        }
    }

    /// Number of destination textures a host may bind for this kind
    pub fn accepts_texture_count(self, count: usize) -> bool {
        match self {
            VideoKind::None => false,
            VideoKind::I420 => count == 3 || count == 4,
            VideoKind::Argb => count == 1,
        }
    }

    /// Pixel format of the staging resource used for a plane of this kind
    pub fn plane_format(self) -> PixelFormat {
        match self {
            VideoKind::Argb => PixelFormat::Bgra8,
            _ => PixelFormat::R8,
        }
    }

    /// Dimensions of plane `index` for a `width` x `height` frame
    pub fn plane_size(self, index: usize, width: u32, height: u32) -> (u32, u32) {
        match (self, index) {
            (VideoKind::I420, 1) | (VideoKind::I420, 2) => {
                (width.div_ceil(2), height.div_ceil(2))
            }
            _ => (width, height),
        }
    }
}

/// Pixel format of a staging resource.
///
/// Declaration order is the ordering used by [`StagingDesc`].
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PixelFormat {
    R8 = 0,    // 1 plane: r, 8 bits per pixel. Used for each plane of a planar frame
    Rg8 = 1,   // 1 plane: rg, 16 bits per pixel
    Rgba8 = 2, // 1 plane: rgba, 32 bits per pixel
    Bgra8 = 3, // 1 plane: bgra, 32 bits per pixel
}

impl PixelFormat {
    pub fn bytes_per_pixel(self) -> u32 {
        match self {
            PixelFormat::R8 => 1,
            PixelFormat::Rg8 => 2,
            PixelFormat::Rgba8 | PixelFormat::Bgra8 => 4,
        }
    }

    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PixelFormat::R8),
            1 => Some(PixelFormat::Rg8),
            2 => Some(PixelFormat::Rgba8),
            3 => Some(PixelFormat::Bgra8),
            _ => None,
        }
    }
}

/// Key of the staging resource pool.
///
/// Equality and ordering are (format, width, height) lexicographic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StagingDesc {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl StagingDesc {
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        Self {
            format,
            width,
            height,
        }
    }

    /// Tightly packed bytes in one row
    pub fn row_bytes(&self) -> usize {
        self.width as usize * self.format.bytes_per_pixel() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Rectangle covering the whole resource
    pub fn bounds(&self) -> VideoRect {
        VideoRect::new(0, 0, self.width as i32, self.height as i32)
    }
}

/// Integer rectangle in texel coordinates
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct VideoRect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl VideoRect {
    pub const fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn has_zero_area(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    pub fn right(&self) -> i32 {
        self.x + self.width
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.height
    }

    /// Smallest rectangle containing both
    pub fn union(&self, other: &VideoRect) -> VideoRect {
        let x = self.x.min(other.x);
        let y = self.y.min(other.y);
        VideoRect {
            x,
            y,
            width: self.right().max(other.right()) - x,
            height: self.bottom().max(other.bottom()) - y,
        }
    }

    /// Overlap of both, `None` when they do not overlap
    pub fn intersect(&self, other: &VideoRect) -> Option<VideoRect> {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = self.right().min(other.right());
        let y2 = self.bottom().min(other.bottom());
        let rect = VideoRect::new(x1, y1, x2 - x1, y2 - y1);
        rect.is_valid().then_some(rect)
    }

    pub fn contains(&self, other: &VideoRect) -> bool {
        self.x <= other.x
            && self.y <= other.y
            && self.right() >= other.right()
            && self.bottom() >= other.bottom()
    }

    /// Map a rectangle from a `from` sized plane onto a `to` sized plane,
    /// rounding outward so no damaged texel is lost.
    pub fn scale(&self, from: (u32, u32), to: (u32, u32)) -> VideoRect {
        if from == to || from.0 == 0 || from.1 == 0 {
            return *self;
        }
        let scale_down = |v: i32, num: u32, den: u32| -> i32 {
            ((v.max(0) as i64 * num as i64) / den as i64) as i32
        };
        let scale_up = |v: i32, num: u32, den: u32| -> i32 {
            ((v.max(0) as i64 * num as i64 + den as i64 - 1) / den as i64) as i32
        };
        let x = scale_down(self.x, to.0, from.0);
        let y = scale_down(self.y, to.1, from.1);
        let right = scale_up(self.right(), to.0, from.0);
        let bottom = scale_up(self.bottom(), to.1, from.1);
        VideoRect::new(x, y, right - x, bottom - y)
    }
}

/// Opaque handle of a host-owned destination texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub usize);

impl TextureHandle {
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Destination texture bound by the host for one plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub texture: TextureHandle,
    pub width: u32,
    pub height: u32,
}

impl TextureDesc {
    pub fn new(texture: TextureHandle, width: u32, height: u32) -> Self {
        Self {
            texture,
            width,
            height,
        }
    }
}
