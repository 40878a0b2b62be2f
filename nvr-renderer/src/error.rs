use crate::config::ConfigError;
use crate::StreamId;
use nvr_gpu::{BackendError, StagingError};
use nvr_video::VideoKind;
use thiserror::Error;

/// Errors returned to the host by renderer calls
#[derive(Debug, Error)]
pub enum RendererError {
    #[error("graphics device is not initialized")]
    NotInitialized,

    #[error("a backend must be supplied to initialize the device")]
    BackendRequired,

    #[error("unknown stream {0}")]
    UnknownStream(StreamId),

    #[error("{count} textures cannot be bound to a {kind:?} stream")]
    InvalidTextures { kind: VideoKind, count: usize },

    #[error("stream {id} is {current:?}, not {requested:?}")]
    KindMismatch {
        id: StreamId,
        current: VideoKind,
        requested: VideoKind,
    },

    #[error("unsupported video kind {0:?}")]
    UnsupportedKind(VideoKind),

    #[error("render tick called from a thread other than the render thread")]
    WrongThread,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// Why a single stream's upload was abandoned for one tick
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("plane {plane} is {plane_size:?} but its texture is {texture:?}")]
    SizeMismatch {
        plane: usize,
        plane_size: (u32, u32),
        texture: (u32, u32),
    },

    #[error("frame has no data for plane {0}")]
    MissingPlane(usize),

    #[error("mapped staging for plane {plane} held {rows} of {needed} rows")]
    ShortMapping {
        plane: usize,
        rows: usize,
        needed: usize,
    },

    #[error("plane {plane} cannot be copied to its texture: {source}")]
    Destination {
        plane: usize,
        #[source]
        source: BackendError,
    },

    #[error("device copy of plane {plane} failed after {copies} regions: {source}")]
    CopyInterrupted {
        plane: usize,
        copies: usize,
        #[source]
        source: BackendError,
    },

    #[error(transparent)]
    Staging(#[from] StagingError),

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl UploadError {
    /// Device copy regions issued before the upload stopped
    pub fn copies_issued(&self) -> usize {
        match self {
            UploadError::CopyInterrupted { copies, .. } => *copies,
            _ => 0,
        }
    }
}
