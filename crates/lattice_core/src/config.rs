//! Space configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_true() -> bool {
    true
}

fn default_root_load_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_load_retry_interval() -> Duration {
    Duration::from_secs(1)
}

/// Configuration for a space's document loading and fragmentation behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpaceConfig {
    /// Fail root document loads instead of falling back to a fresh local
    /// document. Intended for production hosts where a missing root is a
    /// deployment error, not a draft space.
    #[serde(default)]
    pub strict_root_load: bool,

    /// Store newly added objects in their own linked documents instead of
    /// inline in the root document.
    #[serde(default = "default_true")]
    pub fragmentation_enabled: bool,

    /// Per-attempt timeout when waiting for the root document to become
    /// ready. In strict mode attempts repeat indefinitely; otherwise a
    /// single attempt fails fast.
    #[serde(default = "default_root_load_timeout")]
    pub root_load_timeout: Duration,

    /// Interval between readiness re-checks for linked document loads.
    #[serde(default = "default_load_retry_interval")]
    pub load_retry_interval: Duration,
}

impl Default for SpaceConfig {
    fn default() -> Self {
        Self {
            strict_root_load: false,
            fragmentation_enabled: true,
            root_load_timeout: default_root_load_timeout(),
            load_retry_interval: default_load_retry_interval(),
        }
    }
}
