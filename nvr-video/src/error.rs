use thiserror::Error;

/// Reasons a source frame cannot be taken into a [`crate::FrameObject`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame has no video kind")]
    UnknownKind,

    #[error("frame has zero area ({width}x{height})")]
    EmptyFrame { width: u32, height: u32 },

    #[error("required plane {0} is missing")]
    MissingPlane(usize),

    #[error("plane {plane} stride {stride} is shorter than a row ({row_bytes} bytes)")]
    StrideTooSmall {
        plane: usize,
        stride: u32,
        row_bytes: usize,
    },

    #[error("plane {plane} holds {len} bytes, {needed} needed")]
    PlaneTooShort {
        plane: usize,
        len: usize,
        needed: usize,
    },

    #[error("out of memory while copying plane {0}")]
    OutOfMemory(usize),
}
