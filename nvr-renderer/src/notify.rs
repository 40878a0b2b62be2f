//! Size-changed notification toward the host

use crate::StreamId;
use parking_lot::RwLock;
use std::sync::Arc;

/// Called with the new (width, height) of a stream whose frames no longer
/// match its bound textures
pub type SizeChangedCallback = Arc<dyn Fn(u32, u32, StreamId) + Send + Sync>;

#[derive(Default)]
pub struct SizeNotifier {
    callback: RwLock<Option<SizeChangedCallback>>,
}

impl SizeNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, callback: Option<SizeChangedCallback>) {
        *self.callback.write() = callback;
    }

    pub fn is_set(&self) -> bool {
        self.callback.read().is_some()
    }

    /// Invoke the callback, if any. No lock is held during the call, so the
    /// host may call back into the renderer.
    pub fn notify(&self, width: u32, height: u32, id: StreamId) -> bool {
        let callback = self.callback.read().clone();
        match callback {
            Some(callback) => {
                callback(width, height, id);
                true
            }
            None => false,
        }
    }
}
