//! Native video renderer - graphics side
//!
//! Key features:
//! - Object-safe [`RenderBackend`] trait, one implementation per graphics API
//! - Deferred-reclaim [`StagingPool`] keyed by (format, width, height)
//! - [`HostBackend`] keeping resources in CPU memory

pub mod backend;
pub mod error;
pub mod host;
pub mod staging_pool;

pub use backend::*;
pub use error::*;
pub use host::{CopyRecord, HostBackend, HostTexture};
pub use staging_pool::*;
