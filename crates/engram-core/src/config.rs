//! Memory subsystem configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for the memory system
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Directory for file-backed tier stores (None for in-memory)
    pub storage_dir: Option<PathBuf>,
    /// Whether the background consolidation schedule runs
    pub consolidation_enabled: bool,
    /// How often consolidation runs
    pub consolidation_interval: Duration,
    /// Default lifetime of a working item when no expiry is given
    pub working_ttl: Duration,
    /// Importance at or above which an expired working item is promoted
    pub promotion_importance_threshold: f32,
    /// Access count at or above which an expired working item is promoted
    pub promotion_access_threshold: u32,
    /// Text length above which an expired working item is promoted
    pub promotion_content_length: usize,
    /// Minimum importance change worth persisting during recompute
    pub importance_write_threshold: f32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            consolidation_enabled: true,
            consolidation_interval: Duration::from_secs(6 * 3600),
            working_ttl: Duration::from_secs(3600),
            promotion_importance_threshold: 0.7,
            promotion_access_threshold: 5,
            promotion_content_length: 100,
            importance_write_threshold: 0.1,
        }
    }
}

impl MemoryConfig {
    /// Create config with file-backed storage under a directory
    pub fn with_storage_dir(path: impl AsRef<Path>) -> Self {
        Self {
            storage_dir: Some(path.as_ref().to_path_buf()),
            ..Default::default()
        }
    }

    /// Disable the background consolidation schedule
    pub fn without_consolidation(mut self) -> Self {
        self.consolidation_enabled = false;
        self
    }

    /// Set the consolidation interval
    pub fn consolidation_interval(mut self, interval: Duration) -> Self {
        self.consolidation_interval = interval;
        self
    }

    /// Set the default working-memory lifetime
    pub fn working_ttl(mut self, ttl: Duration) -> Self {
        self.working_ttl = ttl;
        self
    }
}
