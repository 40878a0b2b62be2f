//! Native video renderer - frame data model
//!
//! CPU-side half of the decoded-frame upload path.
//!
//! Key pieces:
//! - Borrowed [`FrameView`] for media engine callbacks, owned [`FrameDesc`] copies
//! - Move-only [`FrameObject`] with an explicit ownership state
//! - Bounded allocate-or-reuse [`FramePool`]
//! - Stride-aware plane copies into mapped staging memory

pub mod error;
pub mod frame;
pub mod frame_pool;
pub mod plane_copy;
pub mod types;

pub use error::*;
pub use frame::*;
pub use frame_pool::*;
pub use plane_copy::*;
pub use types::*;
