//! Resource limits for a sandbox instance

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default memory ceiling in MiB.
pub const DEFAULT_MEMORY_LIMIT_MIB: u64 = 128;

/// Default wall-clock time limit in milliseconds.
pub const DEFAULT_TIME_LIMIT_MS: u64 = 10_000;

/// Resource limits enforced on one isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// V8 heap ceiling in MiB
    pub memory_limit_mib: u64,

    /// Deadline armed by every `execute()`; on expiry the instance self-destroys
    pub time_limit: Duration,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_limit_mib: DEFAULT_MEMORY_LIMIT_MIB,
            time_limit: Duration::from_millis(DEFAULT_TIME_LIMIT_MS),
        }
    }
}

impl ResourceLimits {
    /// Create limits from the raw option values (MiB, milliseconds)
    pub fn new(memory_limit_mib: u64, time_limit_ms: u64) -> Self {
        Self {
            memory_limit_mib,
            time_limit: Duration::from_millis(time_limit_ms),
        }
    }

    /// Heap ceiling in bytes, as handed to V8
    pub fn heap_bytes(&self) -> usize {
        (self.memory_limit_mib as usize).saturating_mul(1024 * 1024)
    }
}
