//! Native video renderer - frame handoff and render tick
//!
//! Key features:
//! - Latest-wins [`StreamDispatcher`] per stream, fed from producer threads
//! - Idempotent [`DirtySet`] of streams awaiting upload
//! - Two-phase per-stream upload in [`Renderer::render_tick`]
//! - Host device lifecycle with pluggable [`nvr_gpu::RenderBackend`]s

pub mod config;
pub mod dirty;
pub mod dispatcher;
pub mod error;
pub mod notify;
pub mod renderer;
pub mod source;
pub mod tick;

pub use config::{ConfigError, RendererConfig};
pub use dirty::DirtySet;
pub use dispatcher::{
    DropReason, PendingUpload, StreamDispatcher, StreamId, StreamMode, StreamStats, SubmitOutcome,
};
pub use error::{RendererError, UploadError};
pub use notify::{SizeChangedCallback, SizeNotifier};
pub use renderer::{Renderer, RendererStats};
pub use source::{FrameSink, FrameSource, LocalFrameSource};
pub use tick::TickReport;

/// Crate version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
