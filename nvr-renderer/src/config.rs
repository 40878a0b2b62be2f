//! Renderer tuning knobs

use nvr_gpu::{DEFAULT_FRAMES_UNTIL_EVICT, DEFAULT_FRAMES_UNTIL_SAFE};
use nvr_video::{DEFAULT_MAX_FREE, DEFAULT_MAX_LIVE};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("frames_until_safe must be at least 1")]
    ZeroSafetyDelay,

    #[error("frames_until_evict ({evict}) must exceed frames_until_safe ({safe})")]
    EvictionTooSoon { safe: u64, evict: u64 },

    #[error("max_frame_objects must be at least 1")]
    NoFrameObjects,

    #[error("max_free_frames ({free}) exceeds max_frame_objects ({live})")]
    FreeListTooLarge { free: usize, live: usize },
}

/// Memory versus stall-risk trade-offs of the upload path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RendererConfig {
    /// Ticks a released staging resource waits before reuse. Must exceed
    /// the deepest GPU queue the host keeps in flight.
    pub frames_until_safe: u64,
    /// Idle ticks before a free staging resource is destroyed
    pub frames_until_evict: u64,
    pub max_free_frames: usize,
    /// Frame objects alive at once; producers drop frames beyond it
    pub max_frame_objects: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_until_safe: DEFAULT_FRAMES_UNTIL_SAFE,
            frames_until_evict: DEFAULT_FRAMES_UNTIL_EVICT,
            max_free_frames: DEFAULT_MAX_FREE,
            max_frame_objects: DEFAULT_MAX_LIVE,
        }
    }
}

impl RendererConfig {
    pub fn with_frames_until_safe(mut self, ticks: u64) -> Self {
        self.frames_until_safe = ticks;
        self
    }

    pub fn with_frames_until_evict(mut self, ticks: u64) -> Self {
        self.frames_until_evict = ticks;
        self
    }

    pub fn with_max_free_frames(mut self, count: usize) -> Self {
        self.max_free_frames = count;
        self
    }

    pub fn with_max_frame_objects(mut self, count: usize) -> Self {
        self.max_frame_objects = count;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.frames_until_safe == 0 {
            return Err(ConfigError::ZeroSafetyDelay);
        }
        if self.frames_until_evict <= self.frames_until_safe {
            return Err(ConfigError::EvictionTooSoon {
                safe: self.frames_until_safe,
                evict: self.frames_until_evict,
            });
        }
        if self.max_frame_objects == 0 {
            return Err(ConfigError::NoFrameObjects);
        }
        if self.max_free_frames > self.max_frame_objects {
            return Err(ConfigError::FreeListTooLarge {
                free: self.max_free_frames,
                live: self.max_frame_objects,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = RendererConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.frames_until_safe, 3);
        assert_eq!(config.frames_until_evict, 3600);
    }

    #[test]
    fn test_validation() {
        let base = RendererConfig::default();

        assert_eq!(
            base.with_frames_until_safe(0).validate(),
            Err(ConfigError::ZeroSafetyDelay)
        );
        assert_eq!(
            base.with_frames_until_safe(5).with_frames_until_evict(5).validate(),
            Err(ConfigError::EvictionTooSoon { safe: 5, evict: 5 })
        );
        assert_eq!(
            base.with_max_frame_objects(0).validate(),
            Err(ConfigError::NoFrameObjects)
        );
        assert!(matches!(
            base.with_max_free_frames(100).with_max_frame_objects(10).validate(),
            Err(ConfigError::FreeListTooLarge { .. })
        ));
    }
}
