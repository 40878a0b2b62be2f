use crate::backend::StagingId;
use nvr_video::{StagingDesc, TextureHandle};
use thiserror::Error;

/// Failures reported by a graphics backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("graphics device is not initialized")]
    DeviceNotReady,

    #[error("graphics device was lost")]
    DeviceLost,

    #[error("failed to create staging resource {desc:?}: {reason}")]
    CreateFailed { desc: StagingDesc, reason: String },

    #[error("failed to map staging resource {0:?}")]
    MapFailed(StagingId),

    #[error("unknown staging resource {0:?}")]
    UnknownStaging(StagingId),

    #[error("unknown destination texture {0:?}")]
    UnknownTexture(TextureHandle),

    #[error("staging is {staging:?} but destination texture is {texture:?}")]
    SizeMismatch {
        staging: (u32, u32),
        texture: (u32, u32),
    },

    #[error("device copy failed: {0}")]
    CopyFailed(String),
}

/// Failures of [`crate::StagingPool::acquire`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StagingError {
    #[error("staging resource requested with zero area: {0:?}")]
    EmptyDesc(StagingDesc),

    #[error(transparent)]
    Backend(#[from] BackendError),
}
